//! Quota error types.

/// Errors produced by the quota ledger and its stores.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("quota exceeded: {requested} bytes requested, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
