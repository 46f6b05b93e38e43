use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ricewatch-cli")]
#[command(about = "Scrape rice listings into the product store")]
struct Cli {
    /// Print the run summary as JSON instead of a single line.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract listings from every enabled site and upsert them.
    Scrape {
        /// YAML site registry; falls back to the built-in sites when absent.
        #[arg(long)]
        sites: Option<PathBuf>,
    },
    /// Upsert the bundled sample listings.
    Seed,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Scrape { sites: None }) {
        Commands::Scrape { sites } => {
            let summary = ricewatch_sync::run_scrape_once_from_env(sites).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "scrape complete: run_id={} sites={} extracted={} saved={}",
                    summary.run_id,
                    summary.sites.len(),
                    summary.total_extracted(),
                    summary.total_saved()
                );
            }
        }
        Commands::Seed => {
            let summary = ricewatch_sync::run_seed_once_from_env().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                let rows = summary
                    .row_count
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                println!(
                    "seed complete: inserted={}/{} rows={rows}",
                    summary.inserted, summary.attempted
                );
            }
        }
    }

    Ok(())
}
