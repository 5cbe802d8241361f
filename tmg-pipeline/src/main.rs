//! tmg-pipeline - daily pulsar timing batch run
//!
//! Ingests new observation files, refits every pulsar with new data, runs
//! the anomaly checker and rewrites the monitoring state. Per-pulsar
//! failures are reported, never fatal; the process exits non-zero only when
//! the run itself could not proceed.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tmg_common::config::{load_toml_config, resolve_root_folder, RootLayout, ROOT_FOLDER_ENV};
use tmg_common::events::EventBus;
use tmg_common::pipeline_config::load_global_config;
use tmg_pipeline::services::{notifier, RunOptions, RunOrchestrator};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const GLOBAL_CONFIG_NAME: &str = "global_config.json";
const EVENT_BUS_CAPACITY: usize = 256;

/// Command-line arguments for tmg-pipeline
#[derive(Parser, Debug)]
#[command(name = "tmg-pipeline")]
#[command(about = "Pulsar timing batch pipeline")]
#[command(version)]
struct Args {
    /// Root folder holding sources/, the database, workspace/ and monitor/
    #[arg(short, long, env = ROOT_FOLDER_ENV)]
    root_folder: Option<PathBuf>,

    /// Global pipeline configuration JSON
    #[arg(short, long, env = "TMG_GLOBAL_CONFIG")]
    global_config: Option<PathBuf>,

    /// Bootstrap TOML (default: platform config dir)
    #[arg(short, long, env = "TMG_BOOTSTRAP")]
    bootstrap: Option<PathBuf>,

    /// Concurrent pulsar workers (default from global config)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Only process these pulsars (repeatable)
    #[arg(short, long = "pulsar")]
    pulsars: Vec<String>,

    /// Skip the Master Database scan
    #[arg(long)]
    skip_ingest: bool,

    /// Only rebuild the monitoring state
    #[arg(long)]
    monitor_only: bool,

    /// Log level when RUST_LOG is unset (overrides the bootstrap file)
    #[arg(long, env = "TMG_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let toml_config = load_toml_config(args.bootstrap.as_deref())
        .context("Failed to load bootstrap config")?;
    init_tracing(&args, &toml_config.logging)?;

    info!(
        "Starting tmg-pipeline v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let root = resolve_root_folder(args.root_folder.as_deref(), ROOT_FOLDER_ENV, &toml_config);
    let layout = RootLayout::new(root, &toml_config);
    layout
        .ensure_directories()
        .context("Failed to initialize root folder")?;
    info!(root = %layout.root.display(), database = %layout.database_path.display(), "Root folder ready");

    let global_path = args
        .global_config
        .clone()
        .or_else(|| toml_config.global_config.clone())
        .unwrap_or_else(|| layout.root.join(GLOBAL_CONFIG_NAME));
    let global = load_global_config(&global_path)
        .with_context(|| format!("Cannot run without global config {}", global_path.display()))?;

    let db = tmg_pipeline::db::init_database(&layout.database_path)
        .await
        .context("Failed to open database")?;

    let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
    let sink = notifier::from_settings(global.notifier.webhook_url.as_deref());
    let (outbox, notifier_task) = notifier::spawn_notifier(sink);

    let orchestrator = RunOrchestrator::new(db.clone(), event_bus, layout, global).with_outbox(outbox);
    let only: BTreeSet<String> = args.pulsars.iter().cloned().collect();

    if args.monitor_only {
        let state = orchestrator
            .monitor_only(&only)
            .await
            .context("Monitoring refresh failed")?;
        info!(pulsars = state.pulsars.len(), "Monitoring state refreshed");
    } else {
        let options = RunOptions {
            pulsars: only,
            skip_ingest: args.skip_ingest,
            workers: args.workers,
        };
        let report = orchestrator.run(&options).await.context("Run aborted")?;

        for pulsar in &report.pulsars {
            info!(
                psr_id = %pulsar.psr_id,
                status = pulsar.status.as_str(),
                new_toas = pulsar.new_toas,
                extraction_failures = pulsar.extraction_failures,
                warnings = pulsar.warnings.len(),
                "Pulsar summary"
            );
        }
    }

    // Dropping the last outbox lets the notifier drain and exit
    drop(orchestrator);
    match notifier_task.await {
        Ok(delivered) => info!(delivered, "Notifier finished"),
        Err(e) => tracing::warn!(error = %e, "Notifier task failed"),
    }

    db.close().await;
    Ok(())
}

fn init_tracing(args: &Args, logging: &tmg_common::config::LoggingConfig) -> Result<()> {
    let default_level = args.log_level.clone().unwrap_or_else(|| logging.level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (stderr_layer, file_layer) = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Cannot open log file {}", path.display()))?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (None, Some(layer))
        }
        None => (Some(tracing_subscriber::fmt::layer()), None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}
