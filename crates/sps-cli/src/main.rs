use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use sps_storage::WriteOutcome;
use sps_sync::{SyncConfig, SyncMode, WriteLedger};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sps")]
#[command(about = "Season partition sync: mirrors upstream football data into CSV partitions")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// Season directory name under the data root.
    #[arg(long, global = true)]
    season: Option<String>,
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,
    /// Print the run summary as JSON.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch upstream records and upsert every partition tree.
    Sync(SyncArgs),
    /// Rebuild the match-level view from the local master files.
    Split,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Read tables from a local snapshot directory instead of the REST API.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
    /// Fetch the whole match history and ignore the watermark.
    #[arg(long)]
    full: bool,
    /// Also maintain the match-level view.
    #[arg(long)]
    match_view: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sps_sync=info,sps_adapters=info,sps_storage=warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(season) = cli.common.season {
        config.season = season;
    }
    if let Some(data_root) = cli.common.data_root {
        config.data_root = data_root;
    }

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            if let Some(dir) = args.snapshot_dir {
                config.snapshot_dir = Some(dir);
            }
            if args.full {
                config.mode = SyncMode::Full;
            }
            config.match_view |= args.match_view;

            let summary = sps_sync::run_sync_once(config).await?;
            if cli.common.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "sync complete: run_id={} season={} watermark={} finished={} fixtures={} player_match_stats={} gameweeks={:?} sealed={:?} excluded={}",
                    summary.run_id,
                    summary.season,
                    summary
                        .watermark
                        .map(|gw| gw.to_string())
                        .unwrap_or_else(|| "none".to_string()),
                    summary.finished_matches,
                    summary.fixtures,
                    summary.player_match_stats,
                    summary.gameweeks,
                    summary.sealed_gameweeks,
                    summary.excluded_rows,
                );
                print_ledger(&summary.ledger);
            }
            fail_on_partition_errors(&summary.ledger)?;
        }
        Commands::Split => {
            let summary = sps_sync::run_split(&config).await?;
            if cli.common.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "split complete: root={} gameweeks={:?} sealed={:?}",
                    summary.root, summary.gameweeks, summary.sealed_gameweeks
                );
                print_ledger(&summary.ledger);
            }
            fail_on_partition_errors(&summary.ledger)?;
        }
    }

    info!("done");
    Ok(())
}

fn print_ledger(ledger: &WriteLedger) {
    println!(
        "partitions: created={} updated={} unchanged={} skipped={} failed={}",
        ledger.count(WriteOutcome::Created),
        ledger.count(WriteOutcome::Updated),
        ledger.count(WriteOutcome::Unchanged),
        ledger.count(WriteOutcome::Skipped),
        ledger.failed_partitions.len()
    );
    for failed in &ledger.failed_partitions {
        eprintln!("failed: {} ({}): {}", failed.path, failed.kind, failed.error);
    }
}

fn fail_on_partition_errors(ledger: &WriteLedger) -> Result<()> {
    if ledger.has_failures() {
        bail!(
            "{} partition update(s) failed",
            ledger.failed_partitions.len()
        );
    }
    Ok(())
}
