//! Append-only security audit log.
//!
//! Rejections are written as JSON Lines, one file per UTC day:
//! `<dir>/<YYYY-MM-DD>.jsonl`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sharevault_protocol::SecurityAuditEvent;
use tracing::debug;

use crate::error::SandboxError;

/// Destination for security audit events.
///
/// Implementations must tolerate concurrent `append` calls.
pub trait AuditSink: Send + Sync {
    /// Appends one event. Existing entries are never modified.
    fn append(&self, event: &SecurityAuditEvent) -> Result<(), SandboxError>;
}

/// In-memory audit log.
#[derive(Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<SecurityAuditEvent>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every recorded event, oldest first.
    pub fn events(&self) -> Vec<SecurityAuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, event: &SecurityAuditEvent) -> Result<(), SandboxError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// JSON Lines audit log on disk.
pub struct JsonlAuditLog {
    dir: PathBuf,
    // Serializes appends so lines from concurrent writers never interleave.
    write_lock: Mutex<()>,
}

impl JsonlAuditLog {
    /// Creates a log writing under `dir`. The directory is created lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Directory holding the daily files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file for `date` (`YYYY-MM-DD`).
    pub fn events_file(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{date}.jsonl"))
    }

    /// Reads every event recorded on `date`. A missing file is an empty day.
    pub fn read_events(&self, date: &str) -> Result<Vec<SecurityAuditEvent>, SandboxError> {
        let path = self.events_file(date);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }
}

impl AuditSink for JsonlAuditLog {
    fn append(&self, event: &SecurityAuditEvent) -> Result<(), SandboxError> {
        let date = event.timestamp.format("%Y-%m-%d").to_string();
        let path = self.events_file(&date);

        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap();
        std::fs::create_dir_all(&self.dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(line.as_bytes())?;

        debug!(file = %path.display(), "appended security audit event");
        Ok(())
    }
}
