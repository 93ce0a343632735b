//! Crate-wide error taxonomy.
//!
//! Mirrors the error kinds the core must distinguish: transient I/O (retry
//! forever), protocol failures from the upstream intake (counted, retried the
//! same as transient I/O), persistent-store unavailability (fall back, never
//! fatal), and configuration errors (fatal at startup only). Classifier
//! parse-unknown is not an error at all — it is a line type — so it has no
//! variant here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("serial I/O error on {port}: {source}")]
    Serial {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no serial port found (configured path absent, known paths unreadable, no /dev match)")]
    SerialPortNotFound,

    #[error("upstream request failed: {0}")]
    Transient(#[from] reqwest::Error),

    #[error("upstream returned non-2xx status {status} for {url}")]
    Protocol { status: u16, url: String },

    #[error("queue store unavailable, falling back to in-memory: {0}")]
    StoreUnavailable(#[source] rusqlite::Error),

    #[error("queue storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("nvr request failed: {0}")]
    Nvr(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
