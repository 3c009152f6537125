use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use keyword_scout::config;
use keyword_scout::kv::KvStore;
use keyword_scout::server;
use keyword_scout::services::{self, Services};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    // Scheduler. Overlapping ticks are harmless: each owner is locked.
    let coordinator = services.coordinator.clone();
    let scan_every = Duration::from_secs(cfg.app.scan_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(scan_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(err) = coordinator.run_cycle().await {
                error!(?err, "scheduled scan failed");
            }
        }
    });

    let credentials = services.credentials.clone();
    let reset_every = Duration::from_secs(cfg.app.usage_reset_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reset_every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!(
                usage = ?credentials.usage_stats(),
                since = %credentials.counting_since(),
                "resetting credential usage counters"
            );
            credentials.reset_counts();
        }
    });

    // Reap locks left by crashed holders and expired replay keys.
    let lock = services.coordinator.lock().clone();
    let kv = services.kv.clone();
    let reap_every = Duration::from_secs((cfg.app.lock_ttl_secs / 2).max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reap_every);
        loop {
            ticker.tick().await;
            if let Err(err) = lock.reap_expired().await {
                warn!(?err, "lock reaper failed");
            }
            if let Err(err) = kv.purge_expired().await {
                warn!(?err, "kv purge failed");
            }
        }
    });

    info!(bind = %cfg.server.bind, "starting keyword scout");
    server::serve(services.app_state(&cfg)).await?;
    Ok(())
}
