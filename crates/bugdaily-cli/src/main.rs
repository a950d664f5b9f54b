use anyhow::Result;
use bugdaily_sync::SyncRunSummary;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bugdaily")]
#[command(about = "Ingest disclosed critical bug bounty reports into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one fetch, upsert and retention sweep batch.
    Ingest {
        /// Print the run summary as JSON instead of a single line.
        #[arg(long)]
        json: bool,
    },
    /// Apply pending schema migrations and exit.
    Migrate,
}

fn summary_line(summary: &SyncRunSummary) -> String {
    let per_source = summary
        .candidates_by_source
        .iter()
        .map(|(source, count)| format!("{source}={count}"))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "ingest complete: run_id={} sources={} candidates=[{}] upserted={} purged={}",
        summary.run_id, summary.enabled_sources, per_source, summary.upserted, summary.purged
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bugdaily=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest { json: false }) {
        Commands::Ingest { json } => {
            let summary = bugdaily_sync::run_sync_once_from_env().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", summary_line(&summary));
            }
        }
        Commands::Migrate => {
            bugdaily_sync::migrate_from_env().await?;
            info!("schema up to date");
        }
    }

    Ok(())
}
