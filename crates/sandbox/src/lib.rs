//! Per-user sandboxing over a shared storage root.
//!
//! Every user sees a virtual filesystem rooted at `/`. This crate maps
//! those virtual paths onto physical paths under the user's sandbox root,
//! rejects anything that would land outside of it (literal `..` escapes as
//! well as symlinks), and records every rejection in an append-only audit
//! log.
//!
//! The virtualizer holds no per-call state and is safe to share across
//! threads; only the audit sink serializes its appends.

mod audit;
mod breadcrumbs;
mod error;
mod virtualizer;
mod writable;

pub use audit::{AuditSink, JsonlAuditLog, MemoryAuditLog};
pub use breadcrumbs::{Breadcrumb, ROOT_LABEL, breadcrumbs};
pub use error::SandboxError;
pub use virtualizer::{PathVirtualizer, normalize_virtual_path, to_virtual};
pub use writable::{WritableState, ensure_writable};
