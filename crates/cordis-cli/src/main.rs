use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cordis_sync::{render_upload, RunOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cordis-cli")]
#[command(about = "Harvest CORDIS project datasets into a PostgREST table")]
struct Cli {
    /// Print the run summary as JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, normalize, cache and upload every enabled generation.
    Run,
    /// Fetch, normalize and cache without uploading.
    Normalize,
    /// Upload a cached batch (the most recent one unless a directory is given).
    Upload {
        #[arg(long)]
        batch_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = cordis_sync::run_sync_once_from_env(RunOptions { upload: true }).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", summary.render());
            }
        }
        Commands::Normalize => {
            let summary = cordis_sync::run_sync_once_from_env(RunOptions { upload: false }).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", summary.render());
            }
        }
        Commands::Upload { batch_dir } => {
            info!(batch_dir = ?batch_dir, "uploading cached batch");
            let upload = cordis_sync::upload_cache_from_env(batch_dir).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&upload)?);
            } else {
                println!("{}", render_upload(&upload));
            }
        }
    }

    Ok(())
}
