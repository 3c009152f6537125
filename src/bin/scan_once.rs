use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use keyword_scout::config;
use keyword_scout::services::{self, Services};

#[derive(Debug, Parser)]
#[command(author, version, about = "Run a single scan cycle, print its summary and exit")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Pretty-print the summary JSON
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let pool = services::open_store(&cfg).await?;
    let services = Services::build(&cfg, pool)?;

    let summary = services.coordinator.run_cycle().await?;
    info!(
        sent = summary.notifications_sent,
        owners = summary.owners.len(),
        "scan complete"
    );
    let out = if args.pretty {
        serde_json::to_string_pretty(&summary)?
    } else {
        serde_json::to_string(&summary)?
    };
    println!("{}", out);
    Ok(())
}
