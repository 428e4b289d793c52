//! Crate-wide error types.
//!
//! Collector contract methods degrade to sentinels (`None` / empty `Vec`)
//! rather than surfacing errors; [`CollectorError`] only crosses the
//! collaborator boundaries (query executors, command runners, document
//! sources) and the drivers that invoke them.

use thiserror::Error;

/// Errors that can occur while talking to a monitoring back-end.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// The back-end rejected or failed a query/command.
    #[error("backend error: {0}")]
    Backend(String),

    /// An external query or command exceeded its configured timeout.
    #[error("timeout elapsed")]
    Timeout,

    /// I/O failure (file tail, process spawn).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON from the runtime monitor.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),
}
