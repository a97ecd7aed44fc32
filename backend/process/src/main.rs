use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use survey_server::{config::StorageConfig, state::init_repository};

/// Recompute every store's stats from its surveys and every helpful counter
/// from its votes.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Write the recomputed values. Without it the run only reports drift.
    #[arg(long)]
    apply: bool,

    /// Hide the progress bar.
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let storage = StorageConfig::load()?;
    let repository = init_repository(&storage).await?;

    let summary =
        process::recalculate_all(repository.as_ref(), args.apply, Utc::now(), !args.quiet).await?;

    if !summary.applied && (summary.updated > 0 || summary.helpful_drift > 0) {
        info!(
            "Re-run with --apply to write {} stores and {} helpful counters",
            summary.updated, summary.helpful_drift
        );
    }

    Ok(())
}
