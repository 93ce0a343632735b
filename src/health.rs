//! Operator HTTP surface: `/healthz` and `/metrics` (spec.md §4.6).
//!
//! A small `axum` router, run alongside the pipeline tasks on its own bound
//! address. Liveness only reflects that the process is up and the state it
//! was handed at construction time; it does not probe the serial port or
//! upstream reachability, since those degrade gracefully rather than making
//! the agent unhealthy (spec.md §7).

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tracing::info;

use crate::metrics::Metrics;
use crate::queue::Queue;

pub struct HealthState {
    pub queue: Arc<Queue>,
    pub metrics: Arc<Metrics>,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    queue_depth: u64,
    version: &'static str,
}

async fn healthz(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    axum::Json(HealthBody {
        status: "ok",
        queue_depth: state.queue.depth(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    state.metrics.queue_depth.set(state.queue.depth() as i64);
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn serve(
    host: String,
    port: u16,
    state: Arc<HealthState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "health server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> Arc<HealthState> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(HealthState {
            queue: Arc::new(Queue::open(&dir.path().join("q.sqlite3"), 1_000_000, 86_400, 50)),
            metrics: Arc::new(Metrics::new()),
        })
    }

    #[tokio::test]
    async fn healthz_returns_ok_status() {
        let app = router(state());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn healthz_body_has_exactly_status_queue_depth_and_version() {
        let app = router(state());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let map = body.as_object().unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map["status"], "ok");
        assert_eq!(map["queue_depth"], 0);
        assert!(map["version"].is_string());
    }

    #[tokio::test]
    async fn metrics_returns_text_exposition() {
        let app = router(state());
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
