//! Durable mirror of transfer tasks for crash recovery.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use sharevault_protocol::{TaskId, TaskRecord};
use tracing::{debug, warn};

use crate::TransferError;

/// Durable storage for task records.
///
/// The queue writes a task through on every state or chunk change and
/// deletes it once it reaches a terminal state.
pub trait PersistenceStore: Send + Sync {
    /// Inserts or replaces the record with the same id.
    fn save_task(&self, record: &TaskRecord) -> Result<(), TransferError>;

    /// Returns every `pending` or `in_progress` record, ordered by id.
    fn load_pending_and_in_progress(&self) -> Result<Vec<TaskRecord>, TransferError>;

    /// Removes a record. Unknown ids are ignored.
    fn delete_task(&self, id: TaskId) -> Result<(), TransferError>;
}

/// In-memory store, mainly for tests.
#[derive(Default)]
pub struct MemoryTaskStore {
    records: RwLock<BTreeMap<TaskId, TaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: TaskId) -> Option<TaskRecord> {
        self.records.read().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceStore for MemoryTaskStore {
    fn save_task(&self, record: &TaskRecord) -> Result<(), TransferError> {
        self.records
            .write()
            .unwrap()
            .insert(record.id, record.clone());
        Ok(())
    }

    fn load_pending_and_in_progress(&self) -> Result<Vec<TaskRecord>, TransferError> {
        Ok(self
            .records
            .read()
            .unwrap()
            .values()
            .filter(|r| r.status.is_active())
            .cloned()
            .collect())
    }

    fn delete_task(&self, id: TaskId) -> Result<(), TransferError> {
        self.records.write().unwrap().remove(&id);
        Ok(())
    }
}

/// One JSON file per task under a state directory.
///
/// Files are replaced atomically (temp file + rename), so a crash leaves
/// either the previous or the new record, never a torn one.
pub struct JsonTaskStore {
    dir: PathBuf,
}

impl JsonTaskStore {
    /// Opens the store, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn task_file(&self, id: TaskId) -> PathBuf {
        self.dir.join(format!("task-{id}.json"))
    }
}

impl PersistenceStore for JsonTaskStore {
    fn save_task(&self, record: &TaskRecord) -> Result<(), TransferError> {
        let json = serde_json::to_string_pretty(record)?;
        let path = self.task_file(record.id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .and_then(|()| std::fs::rename(&tmp, &path))
            .map_err(|e| TransferError::Persistence(format!("saving task {}: {e}", record.id)))?;
        Ok(())
    }

    fn load_pending_and_in_progress(&self) -> Result<Vec<TaskRecord>, TransferError> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let data = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<TaskRecord>(&data) {
                Ok(record) if record.status.is_active() => records.push(record),
                Ok(_) => {}
                Err(e) => warn!(file = %path.display(), error = %e, "skipping unreadable task record"),
            }
        }
        records.sort_by_key(|r| r.id);
        debug!("loaded {} resumable task(s) from {:?}", records.len(), self.dir);
        Ok(records)
    }

    fn delete_task(&self, id: TaskId) -> Result<(), TransferError> {
        match std::fs::remove_file(self.task_file(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::Persistence(format!("deleting task {id}: {e}"))),
        }
    }
}
