//! Agent configuration management.
//!
//! Configuration is stored as TOML at `$XDG_CONFIG_HOME/sharevault/agent.toml`
//! (falling back to `~/.config/sharevault/agent.toml`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sharevault_transfer::QueueConfig;

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root holding every user's sandbox, under `users/<username>`.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Quota figures, task records and the security audit log.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// A user allowed to store files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub id: String,
    pub username: String,
    /// Storage quota in bytes.
    #[serde(default = "default_quota")]
    pub quota_total: u64,
}

fn default_storage_root() -> PathBuf {
    data_dir().join("storage")
}

fn default_state_dir() -> PathBuf {
    data_dir().join("state")
}

fn default_quota() -> u64 {
    10 * 1024 * 1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            state_dir: default_state_dir(),
            queue: QueueConfig::default(),
            users: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the default location), creating
    /// a default file if none exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path(),
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Restrict permissions on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn user(&self, username: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.username == username)
    }

    /// Sandbox root of `username`.
    pub fn user_root(&self, username: &str) -> PathBuf {
        self.storage_root.join("users").join(username)
    }
}

/// Default configuration file path.
pub fn config_path() -> PathBuf {
    config_home().join("sharevault").join("agent.toml")
}

fn config_home() -> PathBuf {
    match std::env::var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => home().join(".config"),
    }
}

fn data_dir() -> PathBuf {
    let base = match std::env::var_os("XDG_DATA_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => home().join(".local").join("share"),
    };
    base.join("sharevault")
}

fn home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.storage_root.ends_with("sharevault/storage"));
        assert!(config.state_dir.ends_with("sharevault/state"));
        assert!(config.users.is_empty());
        assert_eq!(config.queue, QueueConfig::default());
    }

    #[test]
    fn config_partial_toml() {
        let toml_str = r#"
storage_root = "/srv/sharevault"

[queue]
max_concurrent_tasks = 2
chunk_timeout_ms = 1500

[[users]]
id = "u1"
username = "alice"
quota_total = 1000

[[users]]
id = "u2"
username = "bob"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.storage_root, PathBuf::from("/srv/sharevault"));
        assert_eq!(config.queue.max_concurrent_tasks, 2);
        assert_eq!(config.queue.chunk_timeout, Duration::from_millis(1500));
        assert_eq!(config.queue.chunk_size, QueueConfig::default().chunk_size);
        assert_eq!(config.users.len(), 2);
        assert_eq!(config.user("alice").unwrap().quota_total, 1000);
        assert_eq!(config.user("bob").unwrap().quota_total, default_quota());
        assert!(config.user("carol").is_none());
        assert_eq!(
            config.user_root("alice"),
            PathBuf::from("/srv/sharevault/users/alice")
        );
    }

    #[test]
    fn config_path_not_empty() {
        let path = config_path();
        assert!(path.ends_with("sharevault/agent.toml"));
    }

    #[test]
    fn load_creates_default_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("agent.toml");

        let config = Config::load(Some(&path)).unwrap();
        assert!(path.exists());
        assert!(config.users.is_empty());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn config_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("agent.toml");

        let config = Config {
            storage_root: tmp.path().join("storage"),
            users: vec![UserConfig {
                id: "u1".into(),
                username: "alice".into(),
                quota_total: 42,
            }],
            ..Config::default()
        };
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.storage_root, tmp.path().join("storage"));
        assert_eq!(loaded.users, config.users);
        assert_eq!(loaded.queue, config.queue);
    }
}
