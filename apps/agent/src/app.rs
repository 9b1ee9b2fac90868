//! Application orchestrator: wires the sandbox, quota ledger and transfer
//! queue together.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use futures_util::StreamExt;
use sharevault_protocol::{TaskId, TransferStatus, UserIdentity};
use sharevault_quota::{JsonQuotaStore, QuotaLedger};
use sharevault_sandbox::{JsonlAuditLog, PathVirtualizer};
use sharevault_transfer::{
    JsonTaskStore, LocalFsBackend, StaticAuth, StorageBackend, TransferQueue, TransferRequest,
};

use crate::Command;
use crate::config::Config;

/// Runs the agent until the command finishes or shutdown is requested.
pub async fn run(config: Config, command: Command) -> anyhow::Result<()> {
    let agent = Agent::open(&config)?;

    let resumed = agent.queue.recover().await?;
    if !resumed.is_empty() {
        tracing::info!(count = resumed.len(), "resuming interrupted transfers");
    }

    let id = match command {
        Command::Serve => {
            tracing::info!("agent ready");
            tokio::signal::ctrl_c().await?;
            tracing::info!("SIGINT received, shutting down");
            return Ok(());
        }
        Command::Upload {
            username,
            source,
            virtual_dir,
        } => agent.upload(&username, &source, &virtual_dir).await?,
        Command::Download {
            username,
            virtual_path,
            dest,
        } => agent.download(&username, &virtual_path, &dest).await?,
    };

    let status = tokio::select! {
        status = agent.follow(id) => status?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(task_id = %id, "SIGINT received, cancelling transfer");
            agent.queue.cancel(id).await?;
            agent.queue.wait(id).await?
        }
    };

    match status {
        TransferStatus::Completed => Ok(()),
        other => {
            let reason = agent
                .queue
                .status(id)
                .map(|s| s.error)
                .unwrap_or_default();
            bail!("transfer {id} {other}: {reason}")
        }
    }
}

/// Everything needed to serve transfers for the configured users.
pub struct Agent {
    pub queue: TransferQueue,
    virtualizer: Arc<PathVirtualizer>,
    users: HashMap<String, UserIdentity>,
}

impl Agent {
    /// Opens the state directory and prepares every user's sandbox.
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        let quota = Arc::new(
            JsonQuotaStore::new(config.state_dir.join("quota.json"))
                .context("opening quota store")?,
        );

        let mut users = HashMap::new();
        for user in &config.users {
            let root = config.user_root(&user.username);
            std::fs::create_dir_all(&root)
                .with_context(|| format!("creating sandbox for {}", user.username))?;
            quota.upsert_user(&user.id, user.quota_total)?;
            users.insert(
                user.username.clone(),
                UserIdentity {
                    id: user.id.clone(),
                    username: user.username.clone(),
                    base_path: root.canonicalize()?,
                    quota_total: user.quota_total,
                },
            );
        }

        let audit = Arc::new(JsonlAuditLog::new(config.state_dir.join("audit")));
        let virtualizer = Arc::new(PathVirtualizer::new(audit));
        let ledger = Arc::new(QuotaLedger::new(quota));
        let tasks = Arc::new(
            JsonTaskStore::new(config.state_dir.join("tasks")).context("opening task store")?,
        );
        let fs: Arc<dyn StorageBackend> = Arc::new(LocalFsBackend::new());

        let queue = TransferQueue::new(
            config.queue.clone(),
            Arc::clone(&virtualizer),
            ledger,
            tasks,
            Arc::clone(&fs),
            fs,
        );

        tracing::debug!(users = users.len(), state_dir = %config.state_dir.display(), "agent opened");
        Ok(Self {
            queue,
            virtualizer,
            users,
        })
    }

    fn auth(&self, username: &str) -> anyhow::Result<StaticAuth> {
        let identity = self
            .users
            .get(username)
            .with_context(|| format!("unknown user {username}"))?;
        Ok(StaticAuth::new(identity.clone()))
    }

    /// Queues an upload of a local file into `virtual_dir`.
    pub async fn upload(
        &self,
        username: &str,
        source: &Path,
        virtual_dir: &str,
    ) -> anyhow::Result<TaskId> {
        let auth = self.auth(username)?;
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{} has no usable file name", source.display()))?;
        let size = std::fs::metadata(source)
            .with_context(|| format!("reading {}", source.display()))?
            .len();

        let request = TransferRequest::upload(virtual_dir, file_name, source, size);
        Ok(self.queue.submit(&auth, request).await?)
    }

    /// Queues a download of a sandbox file to `dest`.
    pub async fn download(
        &self,
        username: &str,
        virtual_path: &str,
        dest: &Path,
    ) -> anyhow::Result<TaskId> {
        let auth = self.auth(username)?;
        let identity = &self.users[username];
        let (dir, file_name) = virtual_path
            .rsplit_once('/')
            .with_context(|| format!("{virtual_path} is not an absolute virtual path"))?;

        let physical = self
            .virtualizer
            .resolve(username, &identity.base_path, virtual_path)?;
        let size = std::fs::metadata(&physical)
            .with_context(|| format!("{virtual_path} does not exist"))?
            .len();

        let request = TransferRequest::download(dir, file_name, dest, size);
        Ok(self.queue.submit(&auth, request).await?)
    }

    /// Logs progress of a task until it ends; returns the final status.
    pub async fn follow(&self, id: TaskId) -> anyhow::Result<TransferStatus> {
        let mut progress = self.queue.subscribe_progress(id)?;
        while let Some(update) = progress.next().await {
            tracing::info!(
                task_id = %id,
                status = %update.status,
                percent = update.percent,
                bytes = update.bytes_transferred,
                total = update.total_size,
                bytes_per_second = update.bytes_per_second as u64,
                "transfer progress"
            );
        }
        Ok(self.queue.wait(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;
    use sharevault_quota::QuotaStore;

    fn test_config(root: &Path) -> Config {
        let mut config = Config {
            storage_root: root.join("storage"),
            state_dir: root.join("state"),
            users: vec![UserConfig {
                id: "u1".into(),
                username: "alice".into(),
                quota_total: 1_000_000,
            }],
            ..Config::default()
        };
        config.queue.chunk_size = 1024;
        config
    }

    #[tokio::test]
    async fn upload_then_download() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let agent = Agent::open(&config).unwrap();

        let source = tmp.path().join("notes.txt");
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 97) as u8).collect();
        std::fs::write(&source, &payload).unwrap();

        let up = agent.upload("alice", &source, "/docs").await.unwrap();
        assert_eq!(agent.follow(up).await.unwrap(), TransferStatus::Completed);
        let stored = config.user_root("alice").join("docs/notes.txt");
        assert_eq!(std::fs::read(&stored).unwrap(), payload);

        let dest = tmp.path().join("copy.txt");
        let down = agent
            .download("alice", "/docs/notes.txt", &dest)
            .await
            .unwrap();
        assert_eq!(agent.follow(down).await.unwrap(), TransferStatus::Completed);
        assert_eq!(std::fs::read(&dest).unwrap(), payload);

        let quota = JsonQuotaStore::new(config.state_dir.join("quota.json")).unwrap();
        assert_eq!(quota.load("u1").unwrap().quota_used, 5000);
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = Agent::open(&test_config(tmp.path())).unwrap();
        let source = tmp.path().join("a.txt");
        std::fs::write(&source, b"x").unwrap();
        assert!(agent.upload("mallory", &source, "/").await.is_err());
    }

    #[tokio::test]
    async fn escaping_download_is_audited() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let agent = Agent::open(&config).unwrap();

        let dest = tmp.path().join("passwd");
        assert!(
            agent
                .download("alice", "/../../etc/passwd", &dest)
                .await
                .is_err()
        );
        let audit_dir = config.state_dir.join("audit");
        assert_eq!(std::fs::read_dir(audit_dir).unwrap().count(), 1);
    }
}
