//! Edge agent core: POS printer-port tap to durable HTTP intake.
//!
//! Reconstructs receipt transactions from a Verifone Commander printer-port
//! serial stream, coordinates an NVR recording bracket per transaction, and
//! hands derived line/summary payloads to a durable outbound queue for
//! eventual HTTP delivery. Built to run unattended against an intake that
//! may be unreachable for days at a time without losing data.

pub mod classifier;
pub mod config;
pub mod delivery;
pub mod device;
pub mod error;
pub mod health;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod serial_frontend;
pub mod shutdown;
pub mod time;
pub mod transaction;
pub mod video;

pub use error::{AgentError, Result};

/// Initialize structured logging: `RUST_LOG`-driven `EnvFilter` plus a
/// compact formatter, matching the teacher's `tracing_subscriber` setup.
pub fn init_logging() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}
