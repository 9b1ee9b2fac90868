//! ShareVault agent entry point.
//!
//! ```text
//! sharevault-agent [--config <path>] [serve]
//! sharevault-agent [--config <path>] upload <username> <file> <virtual-dir>
//! sharevault-agent [--config <path>] download <username> <virtual-path> <dest>
//! ```

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sharevault-agent", version, about = "ShareVault transfer agent")]
struct Cli {
    /// Configuration file; defaults to `$XDG_CONFIG_HOME/sharevault/agent.toml`.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

/// What the agent was asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Resume interrupted transfers and keep running until Ctrl-C.
    Serve,
    /// Upload a local file into a user's sandbox.
    Upload {
        username: String,
        source: PathBuf,
        /// Sandbox directory receiving the file, e.g. `/docs`.
        virtual_dir: String,
    },
    /// Download a sandbox file to a local path.
    Download {
        username: String,
        virtual_path: String,
        dest: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sharevault=debug")),
        )
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting ShareVault agent"
    );

    let config = config::Config::load(cli.config.as_deref())?;
    tracing::info!(
        storage_root = %config.storage_root.display(),
        users = config.users.len(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, command))?;

    tracing::info!("agent shut down cleanly");
    Ok(())
}
