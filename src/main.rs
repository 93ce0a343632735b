use std::sync::Arc;

use mmd_rv1_agent::config::Config;
use mmd_rv1_agent::model::PosMetadata;
use mmd_rv1_agent::{delivery, device, health, metrics::Metrics, queue::Queue, serial_frontend, shutdown, video};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mmd_rv1_agent::init_logging();

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Configuration is read once at startup and never retried
            // (spec.md §7 "Configuration invalid: fatal at startup only").
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };
    let cfg = Arc::new(cfg);
    info!(pos_type = %cfg.pos_type, "mmd-rv1-agent starting");

    let serial_path = cfg
        .serial_port
        .clone()
        .or_else(|| serial_frontend::detect_port(&cfg).ok())
        .unwrap_or_else(|| "unknown".to_string());
    let device_id = device::resolve_device_id(&cfg, &serial_path);
    let pos_metadata = PosMetadata {
        pos_type: cfg.pos_type.clone(),
        parser_version: cfg.parser_version.clone(),
        terminal_id: device_id.clone(),
        drawer_id: cfg.drawer_id.clone(),
        store_id: cfg.store_id.clone(),
    };

    let queue = Arc::new(Queue::open(
        std::path::Path::new(&cfg.queue_db_path),
        cfg.queue_max_bytes,
        cfg.queue_max_age.as_secs() as i64,
        cfg.queue_trim_batch_size,
    ));
    let metrics = Arc::new(Metrics::new());
    let video = Arc::new(video::VideoCoordinator::new(&cfg));
    let client = delivery::build_client()?;

    let (shutdown_tx, shutdown_rx) = shutdown::channel();

    let health_state = Arc::new(health::HealthState {
        queue: queue.clone(),
        metrics: metrics.clone(),
    });

    let health_handle = tokio::spawn(health::serve(
        cfg.health_host.clone(),
        cfg.health_port,
        health_state,
        shutdown_rx.clone(),
    ));

    let delivery_handle = tokio::spawn(delivery::run(
        queue.clone(),
        client,
        metrics.clone(),
        shutdown_rx.clone(),
    ));

    let eviction_handle = tokio::spawn(eviction_loop(queue.clone(), shutdown_rx.clone()));

    let serial_handle = tokio::spawn(serial_frontend::run(
        cfg.clone(),
        serial_frontend::Pipeline {
            device_id: device_id.clone(),
            pos_metadata,
        },
        queue.clone(),
        metrics.clone(),
        video.clone(),
        shutdown_rx.clone(),
    ));

    shutdown::wait_for_signal(shutdown_tx).await;
    info!("shutdown signal received, draining tasks");

    let _ = serial_handle.await;
    let _ = delivery_handle.await;
    let _ = eviction_handle.await;
    if let Ok(Err(e)) = health_handle.await {
        error!(error = %e, "health server exited with error");
    }

    info!("mmd-rv1-agent stopped");
    Ok(())
}

/// Periodically evict aged-out / over-size jobs (spec.md §4.3 "Eviction"),
/// independent of the opportunistic eviction `Queue::push` already performs.
async fn eviction_loop(queue: Arc<Queue>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                queue.enforce_limits(mmd_rv1_agent::time::unix_now());
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
