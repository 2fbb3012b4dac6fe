//! Error types for the proxy-rotor crate.

use thiserror::Error;

/// Error returned when no usable proxy is available in the pool.
#[derive(Debug, Error)]
#[error("No proxy available in pool")]
pub struct NoProxyAvailable;

/// Errors surfaced by the store, lock and acquisition layers.
///
/// Probe failures never show up here: they are carried as data inside
/// [`ProbeResult`](crate::probe::ProbeResult).
#[derive(Debug, Error)]
pub enum PoolError {
    /// The proxy store rejected or failed an operation.
    #[error("proxy store unavailable: {0}")]
    Store(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The shared key-value store backing the distributed mutex failed.
    #[error("lock store unavailable: {0}")]
    Kv(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A job was submitted outside of a tokio runtime.
    #[error("no async runtime: {0}")]
    Runtime(String),

    /// A proxy source could not be read or parsed.
    #[error("proxy source {source_name} failed: {reason}")]
    Source { source_name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, PoolError>;
