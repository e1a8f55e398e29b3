//! Bloatmark process supervisor.
//!
//! Top of the process tree: spawns one worker per persona, the isolated
//! ping responder, and the front door; health-checks and restarts them;
//! forwards shutdown with a bounded grace window.

mod process;
mod supervisor;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use bloatmark_common::config::Config;

/// Bloatmark supervisor daemon.
#[derive(Parser, Debug)]
#[command(name = "bloatmark", about = "Bloatmark test server supervisor")]
struct Cli {
    /// Directory holding the bloatmark binaries (defaults to the
    /// supervisor's own directory).
    #[arg(long)]
    bin_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let bin_dir = match cli.bin_dir {
        Some(dir) => dir,
        None => std::env::current_exe()?
            .parent()
            .ok_or_else(|| anyhow::anyhow!("cannot locate binary directory"))?
            .to_path_buf(),
    };

    tracing::info!(bin_dir = %bin_dir.display(), "bloatmark supervisor starting");
    supervisor::run(config, bin_dir).await?;
    tracing::info!("bloatmark supervisor stopped");
    Ok(())
}
