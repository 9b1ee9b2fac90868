use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sharevault_protocol::{
    ChunkBitmap, ChunkStatus, ProgressUpdate, TaskId, TaskRecord, TransferKind, TransferStatus,
    UserId, percent_of,
};

/// A contiguous byte range of a transferred file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    /// Absolute byte offset within the file.
    pub offset: u64,
    pub length: u64,
    pub status: ChunkStatus,
}

/// Number of chunks for a file: `ceil(total_size / chunk_size)`, at least 1.
pub fn chunk_count(total_size: u64, chunk_size: u64) -> u32 {
    let chunk_size = chunk_size.max(1);
    total_size.div_ceil(chunk_size).max(1) as u32
}

/// Splits a file into chunks. The last chunk holds the remainder; a
/// zero-byte file yields a single empty chunk.
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    (0..chunk_count(total_size, chunk_size))
        .map(|index| {
            let offset = u64::from(index) * chunk_size;
            Chunk {
                index,
                offset,
                length: chunk_size.min(total_size - offset.min(total_size)),
                status: ChunkStatus::Pending,
            }
        })
        .collect()
}

/// What a consumer asks the queue to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub kind: TransferKind,
    /// Virtual directory inside the user's sandbox.
    pub virtual_dir: String,
    /// File name inside `virtual_dir`; a single path segment.
    pub file_name: String,
    /// Source for uploads, destination for downloads.
    pub local_path: PathBuf,
    /// Declared size in bytes.
    pub total_size: u64,
}

impl TransferRequest {
    pub fn upload(
        virtual_dir: impl Into<String>,
        file_name: impl Into<String>,
        local_path: impl Into<PathBuf>,
        total_size: u64,
    ) -> Self {
        Self {
            kind: TransferKind::Upload,
            virtual_dir: virtual_dir.into(),
            file_name: file_name.into(),
            local_path: local_path.into(),
            total_size,
        }
    }

    pub fn download(
        virtual_dir: impl Into<String>,
        file_name: impl Into<String>,
        local_path: impl Into<PathBuf>,
        total_size: u64,
    ) -> Self {
        Self {
            kind: TransferKind::Download,
            virtual_dir: virtual_dir.into(),
            file_name: file_name.into(),
            local_path: local_path.into(),
            total_size,
        }
    }

    /// Virtual path of the sandbox file: `virtual_dir` joined with
    /// `file_name`.
    pub fn virtual_path(&self) -> String {
        let dir = self.virtual_dir.trim_end_matches(['/', '\\']);
        format!("{dir}/{}", self.file_name)
    }
}

/// Read-only view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub user_id: UserId,
    pub kind: TransferKind,
    pub file_name: String,
    pub virtual_path: String,
    pub status: TransferStatus,
    pub total_size: u64,
    pub bytes_transferred: u64,
    pub percent: f64,
    pub retry_count: u32,
    pub chunks_total: u32,
    pub chunks_done: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Lifecycle of one upload or download (thread-safe).
///
/// `pending → in_progress → {completed, failed, cancelled}`; a pending task
/// may also be cancelled or failed directly. Terminal states are final:
/// every transition method returns `false` and changes nothing once one is
/// reached.
pub struct TransferTask {
    inner: RwLock<TaskInner>,
}

struct TaskInner {
    record: TaskRecord,
    chunks: Vec<Chunk>,
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
}

impl TransferTask {
    /// Builds a task from its durable record.
    ///
    /// Chunk states and `bytes_transferred` are derived from the completion
    /// bitmap, so a record saved mid-transfer resumes without counting any
    /// byte twice.
    pub fn from_record(mut record: TaskRecord) -> Self {
        let mut chunks = plan_chunks(record.total_size, record.chunk_size);
        if record.completed_chunks.len() as usize != chunks.len()
            || !record.completed_chunks.is_well_formed()
        {
            record.completed_chunks = ChunkBitmap::new(chunks.len() as u32);
        }

        let mut transferred = 0;
        for chunk in &mut chunks {
            if record.completed_chunks.get(chunk.index) {
                chunk.status = ChunkStatus::Done;
                transferred += chunk.length;
            }
        }
        record.bytes_transferred = transferred;

        Self {
            inner: RwLock::new(TaskInner {
                record,
                chunks,
                started_at: None,
                completed_at: None,
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.read().unwrap().record.id
    }

    pub fn status(&self) -> TransferStatus {
        self.inner.read().unwrap().record.status
    }

    pub fn kind(&self) -> TransferKind {
        self.inner.read().unwrap().record.kind
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.inner.read().unwrap().record.bytes_transferred
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.read().unwrap().record.retry_count
    }

    /// Copy of the durable record, for persistence.
    pub fn record(&self) -> TaskRecord {
        self.inner.read().unwrap().record.clone()
    }

    /// Chunks that still have to be transferred, in index order.
    pub fn remaining_chunks(&self) -> Vec<Chunk> {
        let s = self.inner.read().unwrap();
        s.chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Done)
            .copied()
            .collect()
    }

    pub fn chunk(&self, index: u32) -> Option<Chunk> {
        self.inner.read().unwrap().chunks.get(index as usize).copied()
    }

    /// Completion is decided by chunk accounting alone.
    pub fn all_chunks_done(&self) -> bool {
        self.inner.read().unwrap().record.completed_chunks.is_complete()
    }

    /// Marks the task as in-progress. Only valid from `pending`.
    pub fn start(&self) -> bool {
        let mut s = self.inner.write().unwrap();
        if s.record.status != TransferStatus::Pending {
            return false;
        }
        s.record.status = TransferStatus::InProgress;
        s.started_at = Some(Instant::now());
        true
    }

    /// Returns the task to `pending`, e.g. after a restart. Only valid from
    /// `in_progress`.
    pub fn requeue(&self) -> bool {
        let mut s = self.inner.write().unwrap();
        if s.record.status != TransferStatus::InProgress {
            return false;
        }
        s.record.status = TransferStatus::Pending;
        for chunk in &mut s.chunks {
            if chunk.status != ChunkStatus::Done {
                chunk.status = ChunkStatus::Pending;
            }
        }
        true
    }

    pub fn mark_in_flight(&self, index: u32) {
        self.set_chunk_status(index, ChunkStatus::InFlight);
    }

    pub fn mark_chunk_failed(&self, index: u32) {
        self.set_chunk_status(index, ChunkStatus::Failed);
    }

    /// Returns a chunk whose result was discarded to `pending`.
    pub fn mark_chunk_pending(&self, index: u32) {
        self.set_chunk_status(index, ChunkStatus::Pending);
    }

    fn set_chunk_status(&self, index: u32, status: ChunkStatus) {
        let mut s = self.inner.write().unwrap();
        if let Some(chunk) = s.chunks.get_mut(index as usize) {
            if chunk.status != ChunkStatus::Done {
                chunk.status = status;
            }
        }
    }

    /// Records a successful chunk.
    ///
    /// Returns `true` if the chunk was newly completed. A chunk that was
    /// already done (re-executed after a restart, say) is not counted again.
    pub fn complete_chunk(&self, index: u32) -> bool {
        let mut s = self.inner.write().unwrap();
        if s.record.status != TransferStatus::InProgress {
            return false;
        }
        let Some(length) = s.chunks.get(index as usize).map(|c| c.length) else {
            return false;
        };
        if !s.record.completed_chunks.set(index) {
            return false;
        }
        s.chunks[index as usize].status = ChunkStatus::Done;
        s.record.bytes_transferred += length;
        true
    }

    /// Adds retries performed by a chunk worker.
    pub fn add_retries(&self, retries: u32) {
        if retries == 0 {
            return;
        }
        let mut s = self.inner.write().unwrap();
        s.record.retry_count = s.record.retry_count.saturating_add(retries);
    }

    /// Marks the task as completed. Only valid from `in_progress` with
    /// every chunk done.
    pub fn complete(&self) -> bool {
        let mut s = self.inner.write().unwrap();
        if s.record.status != TransferStatus::InProgress || !s.record.completed_chunks.is_complete()
        {
            return false;
        }
        s.record.status = TransferStatus::Completed;
        s.completed_at = Some(Instant::now());
        true
    }

    /// Marks the task as failed with a human-readable reason.
    pub fn fail(&self, error: &str) -> bool {
        let mut s = self.inner.write().unwrap();
        if s.record.status.is_terminal() {
            return false;
        }
        s.record.status = TransferStatus::Failed;
        s.record.error = error.to_string();
        s.completed_at = Some(Instant::now());
        true
    }

    /// Marks the task as cancelled.
    pub fn cancel(&self) -> bool {
        let mut s = self.inner.write().unwrap();
        if s.record.status.is_terminal() {
            return false;
        }
        s.record.status = TransferStatus::Cancelled;
        s.completed_at = Some(Instant::now());
        true
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let s = self.inner.read().unwrap();
        let r = &s.record;
        TaskSnapshot {
            id: r.id,
            user_id: r.user_id.clone(),
            kind: r.kind,
            file_name: r.file_name.clone(),
            virtual_path: r.virtual_path.clone(),
            status: r.status,
            total_size: r.total_size,
            bytes_transferred: r.bytes_transferred,
            percent: percent_of(
                r.bytes_transferred,
                r.total_size,
                r.completed_chunks.is_complete(),
            ),
            retry_count: r.retry_count,
            chunks_total: s.chunks.len() as u32,
            chunks_done: r.completed_chunks.count_set(),
            error: r.error.clone(),
        }
    }

    /// Progress update without speed figures; the caller fills those in.
    pub fn progress(&self) -> ProgressUpdate {
        let s = self.inner.read().unwrap();
        let r = &s.record;
        ProgressUpdate {
            task_id: r.id,
            status: r.status,
            bytes_transferred: r.bytes_transferred,
            total_size: r.total_size,
            percent: percent_of(
                r.bytes_transferred,
                r.total_size,
                r.completed_chunks.is_complete(),
            ),
            bytes_per_second: 0.0,
            eta: None,
            error: r.error.clone(),
        }
    }

    /// Time spent in progress, if the task ever started.
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        let s = self.inner.read().unwrap();
        let started = s.started_at?;
        Some(s.completed_at.unwrap_or_else(Instant::now) - started)
    }
}
