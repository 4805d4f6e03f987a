//! Tapeline - Trade Lifecycle Event Pipeline
//! Mission: never lose, never double-count a trade outcome
//!
//! Runs the pipeline components as independent poll-sleep loops: the outcome
//! recorder tails the raw execution log, the reconciler expires abandoned
//! setups, and the performance store folds terminal outcomes into the gating
//! snapshot. Ctrl-C drains every loop: finish the current batch, flush
//! cursors, release locks, exit.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use tapeline::config::PipelineConfig;
use tapeline::events::spine::EventSpine;
use tapeline::gate::GatingConsumer;
use tapeline::perf::PerformanceStore;
use tapeline::reconciler::Reconciler;
use tapeline::recorder::OutcomeRecorder;

#[derive(Parser, Debug)]
#[command(name = "tapeline")]
#[command(about = "Trade-lifecycle event pipeline: setup/outcome join, reconciliation, gating stats")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run all pipeline loops until Ctrl-C (default)
    Run,

    /// One deterministic pass: reconciler scan + performance batch, then exit
    Tick,

    /// Summarize the performance snapshot
    Inspect,

    /// Feed one proposed action (JSON) through the gating consumer
    Decide {
        /// Action JSON, envelope or flat shape
        json: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tapeline=info")),
        )
        .init();

    let args = Args::parse();
    let cfg = PipelineConfig::from_env();

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run_pipeline(cfg).await,
        Commands::Tick => run_tick(cfg),
        Commands::Inspect => inspect_snapshot(cfg),
        Commands::Decide { json } => decide_action(cfg, &json),
    }
}

async fn run_pipeline(cfg: PipelineConfig) -> Result<()> {
    info!(state_dir = %cfg.state_dir.display(), "🚀 tapeline pipeline starting");

    let spine = Arc::new(EventSpine::from_config(&cfg));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let recorder = OutcomeRecorder::new(&cfg, Arc::clone(&spine));
    let reconciler = Reconciler::new(&cfg, Arc::clone(&spine));
    let perf = PerformanceStore::open(&cfg);

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(recorder.run(shutdown_rx.clone())));
    tasks.push(tokio::spawn(reconciler.run(shutdown_rx.clone())));
    tasks.push(tokio::spawn(perf.run(shutdown_rx.clone())));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received; draining loops");
    shutdown_tx.send(true).ok();

    for task in tasks {
        if let Err(e) = task.await {
            warn!("pipeline task panicked: {e}");
        }
    }

    info!("✅ tapeline pipeline stopped cleanly");
    Ok(())
}

/// Single deterministic pass for cron-style deployments and health checks.
fn run_tick(cfg: PipelineConfig) -> Result<()> {
    let spine = Arc::new(EventSpine::from_config(&cfg));

    let emitted = Reconciler::new(&cfg, Arc::clone(&spine)).scan_once();
    let mut store = PerformanceStore::open(&cfg);
    let batch = store.update_once();

    info!(
        reconciled = emitted,
        processed = batch.processed_lines,
        folded = batch.folded,
        "tick complete"
    );
    Ok(())
}

fn inspect_snapshot(cfg: PipelineConfig) -> Result<()> {
    let store = PerformanceStore::open(&cfg);
    let th = store.thresholds();

    println!("snapshot : {}", cfg.perf_snapshot_path().display());
    println!(
        "gates    : min_trades={} probation={} min_avg_r={} max_stdev_r={}",
        th.min_trades, th.probation_trades, th.min_avg_r, th.max_stdev_r
    );
    println!(
        "tiers    : notify>={} execute>={}",
        th.confidence_notify, th.confidence_execute
    );

    let mut rows = store.fingerprints().collect::<Vec<_>>();
    rows.sort_by(|a, b| {
        b.1.confidence.partial_cmp(&a.1.confidence).unwrap_or(std::cmp::Ordering::Equal)
    });

    println!("fingerprints: {}", rows.len());
    for (fp, stats) in rows.iter().take(25) {
        let short: String = fp.chars().take(12).collect();
        println!(
            "  {short}  n={:<4} n_eff={:<8.2} avg_r={:<8} status={:?} conf={:.2}{}",
            stats.count,
            stats.count_with_weight,
            stats.avg_r.map(|v| format!("{v:.3}")).unwrap_or_else(|| "-".into()),
            stats.status,
            stats.confidence,
            stats
                .rejection_reason
                .as_deref()
                .map(|r| format!("  [{r}]"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

fn decide_action(cfg: PipelineConfig, json: &str) -> Result<()> {
    let raw: serde_json::Value = serde_json::from_str(json)?;
    let consumer = GatingConsumer::new(&cfg);

    match consumer.decide(&raw) {
        Some(decision) => println!("{}", serde_json::to_string_pretty(&decision)?),
        None => println!("rejected: malformed action"),
    }
    Ok(())
}
