use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use zazi_storage::SnapshotStore;

#[derive(Debug, Parser)]
#[command(name = "zazi-cli")]
#[command(about = "Zazi iZandi monitoring toolkit command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch both survey generations, reconcile, merge and snapshot.
    Sync,
    /// Derive per-child literacy metrics from assessment snapshots.
    Derive {
        /// Assessment year label, e.g. 2026.
        #[arg(long)]
        year: String,
        #[arg(long)]
        baseline: PathBuf,
        #[arg(long)]
        midline: PathBuf,
        #[arg(long)]
        sessions: PathBuf,
        /// Data root the derived table and Parquet snapshots land under.
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },
    /// Serve the JSON tool API.
    Serve,
    /// Print recent run summaries.
    Report {
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = zazi_pipeline::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} old={} new={} merged={} reports={}",
                summary.run_id,
                summary.old_records,
                summary.new_records,
                summary.merged_records,
                summary.report_dir
            );
        }
        Commands::Derive {
            year,
            baseline,
            midline,
            sessions,
            data_dir,
        } => {
            let store = SnapshotStore::new(data_dir);
            let summary =
                zazi_pipeline::run_derivation(&store, &year, &baseline, &midline, &sessions).await?;
            println!(
                "derive complete: run_id={} year={} rows={} join_misses={} csv={} reports={}",
                summary.run_id,
                summary.year,
                summary.report.derived_rows,
                summary.report.midline_without_baseline,
                summary.progress_csv,
                summary.report_dir
            );
        }
        Commands::Serve => {
            zazi_tools::serve_from_env().await?;
        }
        Commands::Report { data_dir, limit } => {
            let reports_dir = SnapshotStore::new(data_dir).reports_dir();
            if !reports_dir.exists() {
                println!("no runs recorded under {}", reports_dir.display());
                return Ok(());
            }
            let mut entries: Vec<_> = std::fs::read_dir(&reports_dir)?
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
                .collect();
            entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
            entries.reverse();

            for entry in entries.into_iter().take(limit) {
                let run_id = entry.file_name().to_string_lossy().to_string();
                let summary_path = entry.path().join("run_summary.json");
                match std::fs::read_to_string(&summary_path)
                    .ok()
                    .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
                {
                    Some(summary) => println!(
                        "{run_id}: old={} new={} merged={} finished_at={}",
                        summary["old_records"],
                        summary["new_records"],
                        summary["merged_records"],
                        summary["finished_at"].as_str().unwrap_or("?")
                    ),
                    None => println!("{run_id}: (no run summary)"),
                }
            }
        }
    }

    Ok(())
}
