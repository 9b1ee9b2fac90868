//! Shared data model for the sharevault workspace.
//!
//! Every crate that needs to talk about users, transfer tasks, progress or
//! security audit events uses the types defined here, so records written by
//! one component deserialize cleanly in another.

pub mod bitmap;
pub mod events;
pub mod types;

// Re-export primary types for convenience.
pub use bitmap::ChunkBitmap;
pub use events::{AuditEventType, ProgressUpdate, SecurityAuditEvent, percent_of};
pub use types::{
    ChunkStatus, TaskId, TaskRecord, TransferKind, TransferStatus, User, UserId, UserIdentity,
};
