use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bitmap::ChunkBitmap;

/// Opaque user identifier supplied by the identity provider.
pub type UserId = String;

/// Identifier of a transfer task.
///
/// Ids are handed out from a monotonically increasing sequence, so ordering
/// by id is the same as ordering by arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user sharing the storage root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub quota_total: u64,
    pub quota_used: u64,
    /// Sandbox root. Never changes after the user is created.
    pub base_path: PathBuf,
}

/// Identity of the caller, as supplied by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub id: UserId,
    pub username: String,
    pub base_path: PathBuf,
    pub quota_total: u64,
}

impl From<&User> for UserIdentity {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            base_path: user.base_path.clone(),
            quota_total: user.quota_total,
        }
    }
}

/// Direction of a transfer relative to the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// Local file into the user's sandbox.
    Upload,
    /// Sandbox file out to a local destination.
    Download,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// Lifecycle state of a transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl TransferStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` if the task is pending or in progress.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// State of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// Durable mirror of a transfer task, written through on every change.
///
/// Only completion of chunks is persisted (as a bitmap); in-flight state is
/// meaningless after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    pub user_id: UserId,
    pub username: String,
    pub base_path: PathBuf,
    pub kind: TransferKind,
    pub file_name: String,
    pub virtual_path: String,
    /// Client-side file: source for uploads, destination for downloads.
    pub local_path: PathBuf,
    pub total_size: u64,
    pub chunk_size: u64,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub completed_chunks: ChunkBitmap,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}
