use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::DEFAULT_CHUNK_SIZE;
use crate::retry::RetryPolicy;

/// Tunables of the transfer queue.
///
/// Every field has a default, so a partial TOML/JSON table is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Tasks allowed in progress at once; the rest wait in FIFO order.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Chunks of one task in flight at once.
    #[serde(default = "default_max_chunks_per_task")]
    pub max_chunks_per_task: usize,

    /// Chunks in flight across all tasks.
    #[serde(default = "default_max_global_chunks")]
    pub max_global_chunks: usize,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Time limit of a single chunk attempt. Expiry counts as a transient
    /// error.
    #[serde(
        rename = "chunk_timeout_ms",
        with = "millis",
        default = "default_chunk_timeout"
    )]
    pub chunk_timeout: Duration,

    /// Minimum spacing of non-terminal progress updates.
    #[serde(
        rename = "progress_interval_ms",
        with = "millis",
        default = "default_progress_interval"
    )]
    pub progress_interval: Duration,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn default_max_chunks_per_task() -> usize {
    4
}

fn default_max_global_chunks() -> usize {
    16
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_chunk_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(250)
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_chunks_per_task: default_max_chunks_per_task(),
            max_global_chunks: default_max_global_chunks(),
            chunk_size: default_chunk_size(),
            chunk_timeout: default_chunk_timeout(),
            progress_interval: default_progress_interval(),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Clamps limits that would stall the queue.
    pub(crate) fn sanitized(mut self) -> Self {
        self.max_concurrent_tasks = self.max_concurrent_tasks.max(1);
        self.max_chunks_per_task = self.max_chunks_per_task.max(1);
        self.max_global_chunks = self.max_global_chunks.max(1);
        if self.chunk_size == 0 {
            self.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        self
    }
}

/// Serializes a [`Duration`] as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.max_concurrent_tasks, 3);
        assert_eq!(config.max_chunks_per_task, 4);
        assert_eq!(config.max_global_chunks, 16);
        assert_eq!(config.chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.chunk_timeout, Duration::from_secs(30));
        assert_eq!(config.progress_interval, Duration::from_millis(250));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"chunk_size": 1024, "retry": {"max_retries": 5}}"#).unwrap();
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.max_concurrent_tasks, 3);
    }

    #[test]
    fn durations_are_milliseconds() {
        let json = serde_json::to_value(QueueConfig::default()).unwrap();
        assert_eq!(json["chunk_timeout_ms"], 30_000);
        assert_eq!(json["progress_interval_ms"], 250);
        assert_eq!(json["retry"]["initial_delay_ms"], 250);
    }

    #[test]
    fn sanitized_clamps_zero_limits() {
        let config = QueueConfig {
            max_concurrent_tasks: 0,
            max_chunks_per_task: 0,
            max_global_chunks: 0,
            chunk_size: 0,
            ..QueueConfig::default()
        }
        .sanitized();
        assert_eq!(config.max_concurrent_tasks, 1);
        assert_eq!(config.max_chunks_per_task, 1);
        assert_eq!(config.max_global_chunks, 1);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }
}
