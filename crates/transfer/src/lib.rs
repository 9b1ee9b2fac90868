//! Chunked file transfer between local storage and per-user sandboxes.
//!
//! [`TransferQueue`] admits upload and download tasks in FIFO order, splits
//! each file into fixed-size chunks, drives the chunks through a
//! [`StorageBackend`] with bounded concurrency and retry, reports throttled
//! progress, and mirrors every task to a [`PersistenceStore`] so that an
//! interrupted transfer resumes where it stopped.

mod auth;
mod chunked;
mod config;
mod persist;
mod progress;
mod queue;
mod retry;
mod types;
mod validation;
mod worker;

pub use auth::{AuthContext, StaticAuth};
pub use chunked::{LocalFsBackend, StorageBackend, StorageError, StorageFuture, staging_path};
pub use config::QueueConfig;
pub use persist::{JsonTaskStore, MemoryTaskStore, PersistenceStore};
pub use progress::{ProgressStream, SpeedCalculator};
pub use queue::TransferQueue;
pub use retry::RetryPolicy;
pub use types::{Chunk, TaskSnapshot, TransferRequest, TransferTask, chunk_count, plan_chunks};
pub use validation::{validate_file_name, validate_request};

use sharevault_protocol::TaskId;
use sharevault_quota::QuotaError;
use sharevault_sandbox::SandboxError;

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Errors surfaced to queue consumers.
///
/// Path and quota errors are raised synchronously by `submit`, before any
/// task exists. Chunk errors only show up here once retries are exhausted.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("path traversal rejected: {0}")]
    PathTraversal(String),

    #[error("quota exceeded: {requested} bytes requested, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("I/O error: {0}")]
    PermanentIo(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<SandboxError> for TransferError {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::PathTraversal { virtual_path } => Self::PathTraversal(virtual_path),
            SandboxError::Validation(msg) => Self::Validation(msg),
            SandboxError::Io(e) => Self::Io(e),
            SandboxError::Json(e) => Self::Json(e),
        }
    }
}

impl From<QuotaError> for TransferError {
    fn from(e: QuotaError) -> Self {
        match e {
            QuotaError::QuotaExceeded {
                requested,
                available,
            } => Self::QuotaExceeded {
                requested,
                available,
            },
            QuotaError::UnknownUser(user) => Self::Validation(format!("unknown user: {user}")),
            QuotaError::Io(e) => Self::Persistence(e.to_string()),
            QuotaError::Json(e) => Self::Persistence(e.to_string()),
        }
    }
}

impl From<StorageError> for TransferError {
    fn from(e: StorageError) -> Self {
        if e.is_transient() {
            Self::TransientIo(e.to_string())
        } else {
            Self::PermanentIo(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_error_hides_physical_path() {
        let err: TransferError = SandboxError::PathTraversal {
            virtual_path: "/../etc".into(),
        }
        .into();
        assert_eq!(err.to_string(), "path traversal rejected: /../etc");
    }

    #[test]
    fn quota_error_maps_to_quota_exceeded() {
        let err: TransferError = QuotaError::QuotaExceeded {
            requested: 150,
            available: 100,
        }
        .into();
        assert!(matches!(
            err,
            TransferError::QuotaExceeded {
                requested: 150,
                available: 100
            }
        ));
    }

    #[test]
    fn storage_error_classification() {
        let transient: TransferError = StorageError::TimedOut.into();
        assert!(matches!(transient, TransferError::TransientIo(_)));
        let permanent: TransferError = StorageError::Permanent("denied".into()).into();
        assert!(matches!(permanent, TransferError::PermanentIo(_)));
    }
}
