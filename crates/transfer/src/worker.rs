//! Single-chunk execution with retry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sharevault_protocol::TaskId;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunked::{StorageBackend, StorageError};
use crate::retry::RetryPolicy;
use crate::types::Chunk;

/// Everything a chunk worker needs, shared by all chunks of one task.
pub(crate) struct ChunkJob {
    pub task_id: TaskId,
    pub source: Arc<dyn StorageBackend>,
    pub source_path: PathBuf,
    pub dest: Arc<dyn StorageBackend>,
    pub dest_path: PathBuf,
    pub permits: Arc<Semaphore>,
    pub policy: RetryPolicy,
    pub timeout: Duration,
}

pub(crate) enum ChunkOutcome {
    Done,
    /// Stopped before or between attempts; nothing to count.
    Cancelled,
    Failed(StorageError),
}

pub(crate) struct ChunkResult {
    pub index: u32,
    pub retries: u32,
    pub outcome: ChunkOutcome,
}

impl ChunkJob {
    /// Moves one chunk from source to destination.
    ///
    /// Transient errors (including timeouts) are retried with backoff until
    /// the policy gives up. `cancel` is checked before every attempt and
    /// during backoff; an attempt already under way is never interrupted.
    pub(crate) async fn run(self: Arc<Self>, chunk: Chunk, cancel: CancellationToken) -> ChunkResult {
        let mut retries = 0;
        let result = |retries, outcome| ChunkResult {
            index: chunk.index,
            retries,
            outcome,
        };

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return result(retries, ChunkOutcome::Cancelled),
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return result(retries, ChunkOutcome::Cancelled),
                },
            };
            if cancel.is_cancelled() {
                return result(retries, ChunkOutcome::Cancelled);
            }

            let attempt = tokio::time::timeout(self.timeout, self.transfer(&chunk))
                .await
                .unwrap_or(Err(StorageError::TimedOut));
            drop(permit);

            let err = match attempt {
                Ok(()) => {
                    debug!(task_id = %self.task_id, chunk = chunk.index, bytes = chunk.length, "chunk done");
                    return result(retries, ChunkOutcome::Done);
                }
                Err(e) => e,
            };

            if !err.is_transient() || !self.policy.allows_retry(retries) {
                return result(retries, ChunkOutcome::Failed(err));
            }

            retries += 1;
            let delay = self.policy.delay_for_attempt(retries);
            warn!(
                task_id = %self.task_id,
                chunk = chunk.index,
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "chunk failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return result(retries, ChunkOutcome::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn transfer(&self, chunk: &Chunk) -> Result<(), StorageError> {
        let data = self
            .source
            .read_chunk(&self.source_path, chunk.offset, chunk.length)
            .await?;
        if data.len() as u64 != chunk.length {
            return Err(StorageError::Permanent(format!(
                "short read at offset {}: {} of {} bytes",
                chunk.offset,
                data.len(),
                chunk.length
            )));
        }
        self.dest
            .write_chunk(&self.dest_path, chunk.offset, &data)
            .await
    }
}
