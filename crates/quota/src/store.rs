//! Durable quota storage.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::QuotaError;

/// Committed quota figures for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub quota_total: u64,
    pub quota_used: u64,
}

/// Source of truth for committed usage.
///
/// Reservations are never stored here; they only live in the ledger.
pub trait QuotaStore: Send + Sync {
    /// Loads the committed figures for `user_id`.
    fn load(&self, user_id: &str) -> Result<QuotaUsage, QuotaError>;

    /// Persists a new committed usage value.
    fn store_used(&self, user_id: &str, quota_used: u64) -> Result<(), QuotaError>;
}

/// In-memory store, mainly for tests and embedding.
#[derive(Default)]
pub struct MemoryQuotaStore {
    users: RwLock<HashMap<String, QuotaUsage>>,
    loads: AtomicUsize,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces a user's figures.
    pub fn upsert_user(&self, user_id: &str, quota_total: u64, quota_used: u64) {
        self.users.write().unwrap().insert(
            user_id.to_string(),
            QuotaUsage {
                quota_total,
                quota_used,
            },
        );
    }

    /// Number of `load` calls served so far.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

impl QuotaStore for MemoryQuotaStore {
    fn load(&self, user_id: &str) -> Result<QuotaUsage, QuotaError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.users
            .read()
            .unwrap()
            .get(user_id)
            .copied()
            .ok_or_else(|| QuotaError::UnknownUser(user_id.to_string()))
    }

    fn store_used(&self, user_id: &str, quota_used: u64) -> Result<(), QuotaError> {
        let mut users = self.users.write().unwrap();
        let usage = users
            .get_mut(user_id)
            .ok_or_else(|| QuotaError::UnknownUser(user_id.to_string()))?;
        usage.quota_used = quota_used;
        Ok(())
    }
}

/// Quota store persisted to a JSON file.
///
/// Figures are cached in memory and the whole map is rewritten after every
/// change.
pub struct JsonQuotaStore {
    path: PathBuf,
    users: RwLock<HashMap<String, QuotaUsage>>,
}

impl JsonQuotaStore {
    /// Opens the store at `path`, loading existing figures from disk.
    pub fn new(path: PathBuf) -> Result<Self, QuotaError> {
        let users = load_users(&path)?;
        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    /// Creates a user or updates its total, keeping any committed usage.
    pub fn upsert_user(&self, user_id: &str, quota_total: u64) -> Result<(), QuotaError> {
        {
            let mut users = self.users.write().unwrap();
            users
                .entry(user_id.to_string())
                .and_modify(|u| u.quota_total = quota_total)
                .or_insert(QuotaUsage {
                    quota_total,
                    quota_used: 0,
                });
        }
        self.persist()
    }

    /// Returns all known user ids.
    pub fn user_ids(&self) -> Vec<String> {
        self.users.read().unwrap().keys().cloned().collect()
    }

    fn persist(&self) -> Result<(), QuotaError> {
        let users = self.users.read().unwrap();
        let json = serde_json::to_string_pretty(&*users)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("persisted quota for {} user(s) to {:?}", users.len(), self.path);
        Ok(())
    }
}

impl QuotaStore for JsonQuotaStore {
    fn load(&self, user_id: &str) -> Result<QuotaUsage, QuotaError> {
        self.users
            .read()
            .unwrap()
            .get(user_id)
            .copied()
            .ok_or_else(|| QuotaError::UnknownUser(user_id.to_string()))
    }

    fn store_used(&self, user_id: &str, quota_used: u64) -> Result<(), QuotaError> {
        {
            let mut users = self.users.write().unwrap();
            let usage = users
                .get_mut(user_id)
                .ok_or_else(|| QuotaError::UnknownUser(user_id.to_string()))?;
            usage.quota_used = quota_used;
        }
        self.persist()
    }
}

fn load_users(path: &Path) -> Result<HashMap<String, QuotaUsage>, QuotaError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let users: HashMap<String, QuotaUsage> = serde_json::from_str(&data)?;
    debug!("loaded quota for {} user(s) from {:?}", users.len(), path);
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_unknown_user() {
        let store = MemoryQuotaStore::new();
        assert!(matches!(store.load("nobody"), Err(QuotaError::UnknownUser(_))));
        assert!(store.store_used("nobody", 1).is_err());
    }

    #[test]
    fn memory_store_counts_loads() {
        let store = MemoryQuotaStore::new();
        store.upsert_user("u1", 100, 10);
        store.load("u1").unwrap();
        store.load("u1").unwrap();
        assert_eq!(store.load_count(), 2);
    }

    #[test]
    fn json_store_persist_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("quota.json");

        {
            let store = JsonQuotaStore::new(path.clone()).unwrap();
            store.upsert_user("u1", 1000).unwrap();
            store.store_used("u1", 250).unwrap();
        }

        let store = JsonQuotaStore::new(path).unwrap();
        assert_eq!(
            store.load("u1").unwrap(),
            QuotaUsage {
                quota_total: 1000,
                quota_used: 250
            }
        );
    }

    #[test]
    fn json_store_upsert_keeps_usage() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonQuotaStore::new(tmp.path().join("quota.json")).unwrap();
        store.upsert_user("u1", 1000).unwrap();
        store.store_used("u1", 400).unwrap();
        store.upsert_user("u1", 2000).unwrap();

        let usage = store.load("u1").unwrap();
        assert_eq!(usage.quota_total, 2000);
        assert_eq!(usage.quota_used, 400);
        assert_eq!(store.user_ids(), vec!["u1".to_string()]);
    }

    #[test]
    fn json_store_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonQuotaStore::new(tmp.path().join("absent.json")).unwrap();
        assert!(store.user_ids().is_empty());
    }
}
