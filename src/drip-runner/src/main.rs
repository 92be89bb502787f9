//! Drip Runner. Invokes the drip flow engine once, or on a fixed period.
//!
//! All scheduling state lives in the stores, so each tick is an independent
//! invocation and a restarted process simply picks up where the rows say.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};

use drip_channels::SmsProvider;
use drip_core::config::AppConfig;
use drip_engine::{EngineDeps, FlowEngine};
use drip_store::{
    MemoryAccounts, MemoryCatalog, MemoryEntrySource, MemoryLedger, MemoryRunLog,
    MemoryStatusStore,
};

#[derive(Parser, Debug)]
#[command(name = "drip-runner")]
#[command(about = "Advances subscribers through time-delayed SMS drip flows")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, env = "DRIP_CONFIG")]
    config: Option<String>,

    /// Run a single invocation, print the summary as JSON, and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Seconds between invocations (overrides config)
    #[arg(long, env = "DRIP__INTERVAL_SECS")]
    interval_secs: Option<u64>,

    /// Flow catalog JSON file (overrides config)
    #[arg(long, env = "DRIP__CATALOG_PATH")]
    catalog: Option<String>,

    /// Contest entries JSON file (overrides config)
    #[arg(long, env = "DRIP__ENTRIES_PATH")]
    entries: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "DRIP__NODE_ID")]
    node_id: Option<String>,

    /// Maximum due rows per invocation (overrides config)
    #[arg(long, env = "DRIP__BATCH_SIZE")]
    batch_size: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drip_runner=info,drip_engine=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Drip runner starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(secs) = cli.interval_secs {
        config.interval_secs = secs;
    }
    if let Some(path) = cli.catalog {
        config.catalog_path = Some(path);
    }
    if let Some(path) = cli.entries {
        config.entries_path = Some(path);
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }

    info!(
        node_id = %config.node_id,
        batch_size = config.batch_size,
        interval_secs = config.interval_secs,
        once = cli.once,
        "Configuration loaded"
    );

    let engine = build_engine(&config)?;

    if cli.once {
        let summary = engine.invoke(Utc::now()).await;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        if !summary.success {
            anyhow::bail!(
                "invocation failed: {}",
                summary.error.unwrap_or_else(|| "unknown error".into())
            );
        }
        return Ok(());
    }

    let period = std::time::Duration::from_secs(config.interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!("Drip runner is ready");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let summary = engine.invoke(Utc::now()).await;
                if !summary.success {
                    error!(
                        error = summary.error.as_deref().unwrap_or("unknown"),
                        "Invocation failed, retrying next tick"
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}

fn build_engine(config: &AppConfig) -> anyhow::Result<FlowEngine> {
    let catalog = match &config.catalog_path {
        Some(path) => MemoryCatalog::from_json_file(path)
            .with_context(|| format!("loading flow catalog from {}", path))?,
        None => {
            let catalog = MemoryCatalog::new();
            let e = &config.enrollment;
            catalog.seed_demo(&e.welcome_flow, &e.follow_up_flow, &e.ongoing_flow);
            catalog
        }
    };
    let entries = match &config.entries_path {
        Some(path) => MemoryEntrySource::from_json_file(path)
            .with_context(|| format!("loading contest entries from {}", path))?,
        None => MemoryEntrySource::new(),
    };

    let deps = EngineDeps {
        catalog: Arc::new(catalog),
        statuses: Arc::new(MemoryStatusStore::new()),
        run_log: Arc::new(MemoryRunLog::new()),
        entries: Arc::new(entries),
        ledger: Arc::new(MemoryLedger::new()),
        accounts: Arc::new(MemoryAccounts::new()),
        delivery: Arc::new(SmsProvider::new(config.sms.clone())),
    };

    FlowEngine::new(config, deps).context("building flow engine")
}
