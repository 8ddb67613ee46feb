use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use minrepo_sync::{SinkKind, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "minrepo")]
#[command(about = "Collects per-unit slot results from min-repo and stores them")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SinkArg {
    Sqlite,
    Remote,
    None,
}

impl From<SinkArg> for SinkKind {
    fn from(value: SinkArg) -> Self {
        match value {
            SinkArg::Sqlite => SinkKind::Sqlite,
            SinkArg::Remote => SinkKind::Remote,
            SinkArg::None => SinkKind::None,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every configured hall, clean the rows, and load them.
    Scrape {
        #[arg(long, value_enum, default_value = "sqlite")]
        sink: SinkArg,
        /// Only process the first N halls of the list.
        #[arg(long)]
        limit_halls: Option<usize>,
    },
    /// Apply the embedded database migrations.
    Migrate,
    /// Load a cleaned CSV into a sink.
    Load {
        csv: PathBuf,
        #[arg(long, value_enum, default_value = "sqlite")]
        sink: SinkArg,
    },
    /// Print the hosted database schema.
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let _guard = minrepo_sync::init_logging(&config.log_path)?;

    let command = cli.command.unwrap_or(Commands::Scrape {
        sink: SinkArg::Sqlite,
        limit_halls: None,
    });
    match command {
        Commands::Scrape { sink, limit_halls } => {
            let summary = minrepo_sync::run_scrape_from_env(sink.into(), limit_halls).await?;
            println!(
                "scrape complete: run_id={} halls={} failed={} raw_rows={} cleaned_rows={} elapsed={}s artifacts={}",
                summary.run_id,
                summary.halls_total,
                summary.halls_failed,
                summary.raw_rows,
                summary.cleaned_rows,
                summary.elapsed().num_seconds(),
                summary.artifacts_dir
            );
            if let Some(report) = summary.load {
                println!(
                    "loaded into {}: prefectures+{} halls+{} models+{} results+{} skipped={}",
                    summary.backend.unwrap_or("-"),
                    report.new_prefectures,
                    report.new_halls,
                    report.new_models,
                    report.new_results,
                    report.skipped_rows
                );
            }
        }
        Commands::Migrate => {
            let path = minrepo_sync::migrate_from_env().await?;
            println!("migrations applied: {}", path.display());
        }
        Commands::Load { csv, sink } => {
            let report = minrepo_sync::load_csv_from_env(&csv, sink.into()).await?;
            tracing::info!(path = %csv.display(), "csv load finished");
            println!(
                "load complete: prefectures+{} halls+{} models+{} results+{} skipped={}",
                report.new_prefectures,
                report.new_halls,
                report.new_models,
                report.new_results,
                report.skipped_rows
            );
        }
        Commands::Schema => {
            print!("{}", minrepo_persist::REMOTE_SCHEMA_SQL);
        }
    }

    Ok(())
}
