use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{TaskId, TransferStatus};

/// One progress notification for a transfer task.
///
/// `percent` is informational only; completion is decided by chunk
/// accounting, never by this value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub task_id: TaskId,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub total_size: u64,
    pub percent: f64,
    pub bytes_per_second: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<Duration>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ProgressUpdate {
    /// Whether this is the last update the task will ever produce.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Computes a 0–100 percentage. A zero-byte transfer counts as complete
/// only once `done` is set.
pub fn percent_of(transferred: u64, total: u64, done: bool) -> f64 {
    if total == 0 {
        return if done { 100.0 } else { 0.0 };
    }
    (transferred as f64 / total as f64 * 100.0).min(100.0)
}

/// Kinds of security events recorded by the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A `..` sequence climbed above the virtual root.
    PathTraversal,
    /// A symlink inside the sandbox pointed outside of it.
    SymlinkEscape,
    /// Null bytes, drive letters or UNC prefixes.
    MalformedPath,
}

/// Append-only record of a rejected path.
///
/// `path` is the virtual path the caller supplied, never the physical one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAuditEvent {
    pub event_type: AuditEventType,
    pub username: String,
    pub path: String,
    pub timestamp: DateTime<Utc>,
}

impl SecurityAuditEvent {
    /// Creates an event stamped with the current time.
    pub fn new(event_type: AuditEventType, username: &str, path: &str) -> Self {
        Self {
            event_type,
            username: username.to_string(),
            path: path.to_string(),
            timestamp: Utc::now(),
        }
    }
}
