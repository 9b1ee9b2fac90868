use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sharevault_protocol::{TaskId, UserId};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::DEFAULT_CACHE_TTL;
use crate::error::QuotaError;
use crate::store::{QuotaStore, QuotaUsage};

/// Identifier of a provisional quota hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(Uuid);

impl ReservationId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A provisional hold on a user's quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReservation {
    pub id: ReservationId,
    pub user_id: UserId,
    pub bytes_reserved: u64,
    pub task_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time view of a user's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub quota_total: u64,
    pub quota_used: u64,
    /// Sum of active reservations.
    pub reserved: u64,
    pub available: u64,
}

struct CachedUsage {
    usage: QuotaUsage,
    loaded_at: Instant,
}

#[derive(Default)]
struct UserLedger {
    cached: Option<CachedUsage>,
    reservations: HashMap<ReservationId, QuotaReservation>,
}

impl UserLedger {
    /// Returns committed usage, reloading from the store once stale.
    fn usage(
        &mut self,
        store: &dyn QuotaStore,
        user_id: &str,
        ttl: Duration,
    ) -> Result<QuotaUsage, QuotaError> {
        match &self.cached {
            Some(cached) if cached.loaded_at.elapsed() < ttl => Ok(cached.usage),
            _ => self.reload(store, user_id),
        }
    }

    fn reload(&mut self, store: &dyn QuotaStore, user_id: &str) -> Result<QuotaUsage, QuotaError> {
        let usage = store.load(user_id)?;
        debug!(
            user = %user_id,
            total = usage.quota_total,
            used = usage.quota_used,
            "quota loaded from store"
        );
        self.cached = Some(CachedUsage {
            usage,
            loaded_at: Instant::now(),
        });
        Ok(usage)
    }

    fn invalidate(&mut self) {
        self.cached = None;
    }

    fn reserved(&self) -> u64 {
        self.reservations.values().map(|r| r.bytes_reserved).sum()
    }

    fn snapshot(&self, usage: QuotaUsage) -> QuotaSnapshot {
        let reserved = self.reserved();
        QuotaSnapshot {
            quota_total: usage.quota_total,
            quota_used: usage.quota_used,
            reserved,
            available: free_bytes(usage, reserved),
        }
    }
}

fn free_bytes(usage: QuotaUsage, reserved: u64) -> u64 {
    usage
        .quota_total
        .saturating_sub(usage.quota_used)
        .saturating_sub(reserved)
}

/// Per-user reserve/commit/release accounting.
///
/// Operations on one user are serialized by that user's own lock. The
/// outer maps are only held long enough to find or insert an entry.
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    ttl: Duration,
    users: RwLock<HashMap<UserId, Arc<Mutex<UserLedger>>>>,
    // Reservation id -> owning user. Never held while taking a user lock.
    index: RwLock<HashMap<ReservationId, UserId>>,
}

impl QuotaLedger {
    /// Creates a ledger with the default 5-minute cache window.
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self::with_ttl(store, DEFAULT_CACHE_TTL)
    }

    /// Creates a ledger with a custom cache window.
    pub fn with_ttl(store: Arc<dyn QuotaStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            users: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
        }
    }

    fn existing(&self, user_id: &str) -> Option<Arc<Mutex<UserLedger>>> {
        self.users.read().unwrap().get(user_id).cloned()
    }

    /// Finds the ledger of `user_id`. A new one is only kept once the store
    /// has confirmed the user exists.
    fn entry(&self, user_id: &str) -> Result<Arc<Mutex<UserLedger>>, QuotaError> {
        if let Some(entry) = self.existing(user_id) {
            return Ok(entry);
        }
        let mut users = self.users.write().unwrap();
        if let Some(entry) = users.get(user_id) {
            return Ok(Arc::clone(entry));
        }
        let mut ledger = UserLedger::default();
        ledger.reload(self.store.as_ref(), user_id)?;
        let entry = Arc::new(Mutex::new(ledger));
        users.insert(user_id.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.users.read().unwrap().len()
    }

    fn owner_of(&self, id: ReservationId) -> Option<UserId> {
        self.index.read().unwrap().get(&id).cloned()
    }

    /// Reserves `bytes` for `user_id`.
    ///
    /// Succeeds only if committed usage plus all active reservations plus
    /// `bytes` stays within the total; otherwise nothing changes.
    pub fn reserve(
        &self,
        user_id: &str,
        bytes: u64,
        task_id: Option<TaskId>,
    ) -> Result<ReservationId, QuotaError> {
        let entry = self.entry(user_id)?;
        let mut ledger = entry.lock().unwrap();

        let usage = ledger.usage(self.store.as_ref(), user_id, self.ttl)?;
        let available = free_bytes(usage, ledger.reserved());
        if bytes > available {
            info!(user = %user_id, requested = bytes, available, "quota reservation refused");
            return Err(QuotaError::QuotaExceeded {
                requested: bytes,
                available,
            });
        }

        let reservation = QuotaReservation {
            id: ReservationId::new(),
            user_id: user_id.to_string(),
            bytes_reserved: bytes,
            task_id,
            created_at: Utc::now(),
        };
        let id = reservation.id;
        ledger.reservations.insert(id, reservation);
        self.index.write().unwrap().insert(id, user_id.to_string());

        debug!(user = %user_id, reservation = %id, bytes, "quota reserved");
        Ok(id)
    }

    /// Converts a reservation into permanent usage of `actual_bytes`.
    ///
    /// `actual_bytes` is authoritative and may differ from the reserved
    /// estimate. Any excess over the reservation must fit into the user's
    /// remaining free space; if it does not, the reservation is released and
    /// [`QuotaError::QuotaExceeded`] is returned.
    ///
    /// Calling this again once the reservation is gone is a no-op.
    pub fn commit(&self, id: ReservationId, actual_bytes: u64) -> Result<(), QuotaError> {
        self.commit_replacing(id, actual_bytes, 0)
    }

    /// Like [`commit`](Self::commit), for a write that replaced an existing
    /// file of `replaced_bytes`.
    ///
    /// The replaced bytes are credited back, so usage only moves by the net
    /// difference and only net growth has to fit into free space.
    pub fn commit_replacing(
        &self,
        id: ReservationId,
        actual_bytes: u64,
        replaced_bytes: u64,
    ) -> Result<(), QuotaError> {
        let Some(user_id) = self.owner_of(id) else {
            return Ok(());
        };
        let entry = self.entry(&user_id)?;
        let mut ledger = entry.lock().unwrap();

        let Some(reservation) = ledger.reservations.remove(&id) else {
            return Ok(());
        };
        self.index.write().unwrap().remove(&id);

        let usage = match ledger.usage(self.store.as_ref(), &user_id, self.ttl) {
            Ok(u) => u,
            Err(e) => {
                self.restore(&mut ledger, reservation);
                return Err(e);
            }
        };

        // The reservation itself is already out of the ledger, so `free`
        // counts its bytes as available again.
        let free = free_bytes(usage, ledger.reserved());
        let credited = replaced_bytes.min(usage.quota_used);
        let growth = actual_bytes.saturating_sub(credited);
        if growth > free {
            ledger.invalidate();
            warn!(
                user = %user_id,
                reservation = %id,
                reserved = reservation.bytes_reserved,
                actual = actual_bytes,
                "commit exceeds quota, reservation released"
            );
            return Err(QuotaError::QuotaExceeded {
                requested: growth,
                available: free,
            });
        }

        let used = usage.quota_used - credited + actual_bytes;
        if let Err(e) = self.store.store_used(&user_id, used) {
            self.restore(&mut ledger, reservation);
            return Err(e);
        }
        ledger.invalidate();

        info!(
            user = %user_id,
            reservation = %id,
            reserved = reservation.bytes_reserved,
            actual = actual_bytes,
            replaced = credited,
            "quota committed"
        );
        Ok(())
    }

    fn restore(&self, ledger: &mut UserLedger, reservation: QuotaReservation) {
        self.index
            .write()
            .unwrap()
            .insert(reservation.id, reservation.user_id.clone());
        ledger.reservations.insert(reservation.id, reservation);
    }

    /// Drops a reservation without touching committed usage.
    ///
    /// Returns `true` if a reservation was actually released.
    pub fn release(&self, id: ReservationId) -> bool {
        let Some(user_id) = self.owner_of(id) else {
            return false;
        };
        let Some(entry) = self.existing(&user_id) else {
            return false;
        };
        let mut ledger = entry.lock().unwrap();

        let Some(reservation) = ledger.reservations.remove(&id) else {
            return false;
        };
        self.index.write().unwrap().remove(&id);
        ledger.invalidate();

        debug!(
            user = %user_id,
            reservation = %id,
            bytes = reservation.bytes_reserved,
            "quota reservation released"
        );
        true
    }

    /// Cached view of a user's quota.
    pub fn get(&self, user_id: &str) -> Result<QuotaSnapshot, QuotaError> {
        let entry = self.entry(user_id)?;
        let mut ledger = entry.lock().unwrap();
        let usage = ledger.usage(self.store.as_ref(), user_id, self.ttl)?;
        Ok(ledger.snapshot(usage))
    }

    /// Forces a reload from the store.
    pub fn refresh(&self, user_id: &str) -> Result<QuotaSnapshot, QuotaError> {
        let entry = self.entry(user_id)?;
        let mut ledger = entry.lock().unwrap();
        let usage = ledger.reload(self.store.as_ref(), user_id)?;
        Ok(ledger.snapshot(usage))
    }

    /// Looks up an active reservation.
    pub fn reservation(&self, id: ReservationId) -> Option<QuotaReservation> {
        let user_id = self.owner_of(id)?;
        let entry = self.existing(&user_id)?;
        let ledger = entry.lock().unwrap();
        ledger.reservations.get(&id).cloned()
    }

    /// Active reservations of a user, oldest first.
    pub fn active_reservations(&self, user_id: &str) -> Vec<QuotaReservation> {
        let Some(entry) = self.existing(user_id) else {
            return Vec::new();
        };
        let ledger = entry.lock().unwrap();
        let mut out: Vec<_> = ledger.reservations.values().cloned().collect();
        out.sort_by_key(|r| r.created_at);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryQuotaStore;

    fn ledger_with(total: u64, used: u64) -> (Arc<MemoryQuotaStore>, QuotaLedger) {
        let store = Arc::new(MemoryQuotaStore::new());
        store.upsert_user("alice", total, used);
        let ledger = QuotaLedger::new(store.clone());
        (store, ledger)
    }

    fn assert_invariant(ledger: &QuotaLedger, user: &str) {
        let snap = ledger.refresh(user).unwrap();
        assert!(
            snap.quota_used + snap.reserved <= snap.quota_total,
            "invariant broken: {snap:?}"
        );
    }

    #[test]
    fn reserve_over_quota_fails_without_side_effect() {
        let (_store, ledger) = ledger_with(1000, 900);
        let err = ledger.reserve("alice", 150, None).unwrap_err();
        assert!(matches!(
            err,
            QuotaError::QuotaExceeded {
                requested: 150,
                available: 100
            }
        ));
        assert!(ledger.active_reservations("alice").is_empty());
        assert_eq!(ledger.get("alice").unwrap().reserved, 0);
    }

    #[test]
    fn reservations_count_against_quota() {
        let (_store, ledger) = ledger_with(1000, 0);
        ledger.reserve("alice", 600, None).unwrap();
        assert!(ledger.reserve("alice", 500, None).is_err());
        ledger.reserve("alice", 400, None).unwrap();
        assert_eq!(ledger.get("alice").unwrap().available, 0);
    }

    #[test]
    fn commit_moves_bytes_into_usage() {
        let (store, ledger) = ledger_with(1000, 100);
        let id = ledger.reserve("alice", 300, Some(TaskId(1))).unwrap();
        ledger.commit(id, 300).unwrap();

        assert_eq!(store.load("alice").unwrap().quota_used, 400);
        let snap = ledger.get("alice").unwrap();
        assert_eq!(snap.quota_used, 400);
        assert_eq!(snap.reserved, 0);
        assert!(ledger.reservation(id).is_none());
    }

    #[test]
    fn commit_is_idempotent() {
        let (store, ledger) = ledger_with(1000, 0);
        let id = ledger.reserve("alice", 100, None).unwrap();
        ledger.commit(id, 100).unwrap();
        ledger.commit(id, 100).unwrap();
        assert_eq!(store.load("alice").unwrap().quota_used, 100);
    }

    #[test]
    fn commit_uses_actual_bytes() {
        let (store, ledger) = ledger_with(1000, 0);
        let id = ledger.reserve("alice", 500, None).unwrap();
        ledger.commit(id, 320).unwrap();
        assert_eq!(store.load("alice").unwrap().quota_used, 320);
    }

    #[test]
    fn commit_overage_within_free_space() {
        let (store, ledger) = ledger_with(1000, 0);
        let id = ledger.reserve("alice", 100, None).unwrap();
        ledger.commit(id, 150).unwrap();
        assert_eq!(store.load("alice").unwrap().quota_used, 150);
    }

    #[test]
    fn commit_overage_beyond_quota_is_refused() {
        let (store, ledger) = ledger_with(1000, 800);
        let _other = ledger.reserve("alice", 100, None).unwrap();
        let id = ledger.reserve("alice", 50, None).unwrap();

        let err = ledger.commit(id, 200).unwrap_err();
        assert!(matches!(err, QuotaError::QuotaExceeded { .. }));
        assert_eq!(store.load("alice").unwrap().quota_used, 800);
        assert!(ledger.reservation(id).is_none());
        assert_invariant(&ledger, "alice");
    }

    #[test]
    fn release_leaves_usage_untouched() {
        let (store, ledger) = ledger_with(1000, 200);
        let id = ledger.reserve("alice", 300, None).unwrap();
        assert!(ledger.release(id));
        assert!(!ledger.release(id));
        assert_eq!(store.load("alice").unwrap().quota_used, 200);
        assert_eq!(ledger.get("alice").unwrap().available, 800);
    }

    #[test]
    fn commit_after_release_is_noop() {
        let (store, ledger) = ledger_with(1000, 0);
        let id = ledger.reserve("alice", 100, None).unwrap();
        ledger.release(id);
        ledger.commit(id, 100).unwrap();
        assert_eq!(store.load("alice").unwrap().quota_used, 0);
    }

    #[test]
    fn get_is_cached_until_refresh() {
        let (store, ledger) = ledger_with(1000, 0);
        ledger.get("alice").unwrap();
        ledger.get("alice").unwrap();
        assert_eq!(store.load_count(), 1);

        // Out-of-band change is invisible until refreshed.
        store.upsert_user("alice", 1000, 500);
        assert_eq!(ledger.get("alice").unwrap().quota_used, 0);
        assert_eq!(ledger.refresh("alice").unwrap().quota_used, 500);
        assert_eq!(store.load_count(), 2);
    }

    #[test]
    fn commit_and_release_invalidate_cache() {
        let (store, ledger) = ledger_with(1000, 0);
        ledger.get("alice").unwrap();
        let loads = store.load_count();

        let id = ledger.reserve("alice", 10, None).unwrap();
        ledger.release(id);
        ledger.get("alice").unwrap();
        assert_eq!(store.load_count(), loads + 1);
    }

    #[test]
    fn expired_cache_reloads() {
        let store = Arc::new(MemoryQuotaStore::new());
        store.upsert_user("alice", 10, 0);
        let ledger = QuotaLedger::with_ttl(store.clone(), Duration::ZERO);
        ledger.get("alice").unwrap();
        let loads = store.load_count();
        ledger.get("alice").unwrap();
        assert_eq!(store.load_count(), loads + 1);
    }

    #[test]
    fn unknown_user_is_error() {
        let (_store, ledger) = ledger_with(1000, 0);
        assert!(matches!(
            ledger.reserve("mallory", 1, None),
            Err(QuotaError::UnknownUser(_))
        ));
    }

    #[test]
    fn unknown_users_are_not_tracked() {
        let (_store, ledger) = ledger_with(1000, 0);
        ledger.get("alice").unwrap();
        for i in 0..50 {
            let user = format!("ghost-{i}");
            assert!(ledger.reserve(&user, 1, None).is_err());
            assert!(ledger.get(&user).is_err());
            assert!(ledger.active_reservations(&user).is_empty());
        }
        assert_eq!(ledger.tracked_users(), 1);
    }

    #[test]
    fn replacing_commit_charges_net_growth() {
        let (store, ledger) = ledger_with(100, 10);
        let id = ledger.reserve("alice", 10, None).unwrap();
        ledger.commit_replacing(id, 10, 10).unwrap();
        assert_eq!(store.load("alice").unwrap().quota_used, 10);

        let id = ledger.reserve("alice", 40, None).unwrap();
        ledger.commit_replacing(id, 40, 10).unwrap();
        assert_eq!(store.load("alice").unwrap().quota_used, 40);

        let id = ledger.reserve("alice", 5, None).unwrap();
        ledger.commit_replacing(id, 5, 40).unwrap();
        assert_eq!(store.load("alice").unwrap().quota_used, 5);
    }

    #[test]
    fn replacing_commit_checks_only_growth() {
        // Full quota: rewriting a file with one more byte than it had does
        // not fit, rewriting it at the same size does.
        let (store, ledger) = ledger_with(100, 60);
        let _hold = ledger.reserve("alice", 40, None).unwrap();
        let id = ledger.reserve("alice", 0, None).unwrap();

        let err = ledger.commit_replacing(id, 31, 30).unwrap_err();
        assert!(matches!(
            err,
            QuotaError::QuotaExceeded {
                requested: 1,
                available: 0
            }
        ));

        let id = ledger.reserve("alice", 0, None).unwrap();
        ledger.commit_replacing(id, 30, 30).unwrap();
        assert_eq!(store.load("alice").unwrap().quota_used, 60);
        assert_invariant(&ledger, "alice");
    }

    #[test]
    fn invariant_holds_over_mixed_sequence() {
        let (_store, ledger) = ledger_with(10_000, 1_000);
        let mut live: Vec<ReservationId> = Vec::new();
        // Small deterministic LCG; no need for a real RNG here.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let op = (seed >> 33) % 3;
            let amount = (seed >> 17) % 1_500;
            match op {
                0 => {
                    if let Ok(id) = ledger.reserve("alice", amount, None) {
                        live.push(id);
                    }
                }
                1 if !live.is_empty() => {
                    let id = live.remove((amount as usize) % live.len());
                    let _ = ledger.commit(id, amount / 2);
                }
                _ if !live.is_empty() => {
                    let id = live.remove((amount as usize) % live.len());
                    ledger.release(id);
                }
                _ => {}
            }
            assert_invariant(&ledger, "alice");
        }
    }

    #[test]
    fn concurrent_reservations_never_overcommit() {
        let (_store, ledger) = ledger_with(1_000, 0);
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    let mut granted = 0u64;
                    for _ in 0..20 {
                        if ledger.reserve("alice", 7, None).is_ok() {
                            granted += 7;
                        }
                    }
                    granted
                })
            })
            .collect();

        let granted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(granted <= 1_000);
        let snap = ledger.get("alice").unwrap();
        assert_eq!(snap.reserved, granted);
        assert!(snap.available < 7);
    }

    #[test]
    fn users_are_independent() {
        let store = Arc::new(MemoryQuotaStore::new());
        store.upsert_user("alice", 100, 0);
        store.upsert_user("bob", 100, 0);
        let ledger = QuotaLedger::new(store);

        ledger.reserve("alice", 100, None).unwrap();
        ledger.reserve("bob", 100, None).unwrap();
        assert_eq!(ledger.get("alice").unwrap().available, 0);
        assert_eq!(ledger.get("bob").unwrap().available, 0);
    }
}
