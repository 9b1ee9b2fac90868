//! Per-user storage quota accounting.
//!
//! Uploads reserve their estimated size before any byte moves, convert the
//! reservation into permanent usage once the transfer succeeds, and drop it
//! on failure or cancellation. For every user, at every observed instant:
//!
//! ```text
//! quota_used + Σ(active reservations) ≤ quota_total
//! ```
//!
//! Each user's ledger entry has its own lock; users never contend with each
//! other.

mod error;
mod ledger;
mod store;

pub use error::QuotaError;
pub use ledger::{QuotaLedger, QuotaReservation, QuotaSnapshot, ReservationId};
pub use store::{JsonQuotaStore, MemoryQuotaStore, QuotaStore, QuotaUsage};

use std::time::Duration;

/// How long a cached quota read stays fresh.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
