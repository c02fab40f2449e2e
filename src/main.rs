use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use statspipe::backends::init_backend;
use statspipe::config::Config;
use statspipe::pipeline::{BackendHandler, Flusher, MetricAggregator, PipelineHandler};
use statspipe::stats::{self, Statser};
use statspipe::transport::TransportPool;

/// statsd-compatible metric aggregation and forwarding daemon.
#[derive(Parser)]
#[command(name = "statspipe", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("statspipe {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let cfg = Config::default();
            cfg.validate()?;
            cfg
        }
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting statspipe");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    // SIGINT/SIGTERM trigger a graceful shutdown.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            }
            cancel.cancel();
        });
    }

    // Concrete cloud providers are plugged in via the CachedInstances
    // contract; none ship with the core pipeline.
    if !cfg.cloud_provider.is_empty() {
        bail!("unknown cloud provider {:?}", cfg.cloud_provider);
    }

    let pool = TransportPool::new(cfg.transports.clone());
    let mut backends = Vec::new();
    for name in &cfg.backends {
        if let Some(backend) = init_backend(name, &cfg, &pool)? {
            backends.push(backend);
        }
    }
    if backends.is_empty() {
        tracing::warn!("no backends configured, aggregated metrics will be dropped");
    }

    let percentiles = Arc::new(cfg.percentiles.clone());
    let histograms = Arc::new(cfg.timer_histograms.clone());
    let expiry_interval = cfg.expiry_interval;
    let handler = BackendHandler::new(
        backends,
        cfg.shards,
        cfg.shard_queue_size,
        0,
        |_| {
            MetricAggregator::new(
                Arc::clone(&percentiles),
                Arc::clone(&histograms),
                expiry_interval,
            )
        },
        cancel.clone(),
    );

    // Self-metrics: gauges reported by components are pumped back into the
    // pipeline and flushed like everything else.
    let (statser, stats_rx) = Statser::new();
    tokio::spawn(stats::run_pump(stats_rx, handler.clone(), cancel.clone()));
    handler.run_metrics(statser.clone());
    for backend in handler.backends() {
        let backend = backend.clone();
        let cancel = cancel.clone();
        let statser = statser.clone();
        tokio::spawn(async move { backend.run_metrics(cancel, statser).await });
    }

    let flusher = Flusher::new(
        handler.clone(),
        cfg.flush_interval,
        statser.clone(),
        cancel.clone(),
    );
    let flusher_task = tokio::spawn(flusher.run());

    tracing::info!(
        shards = cfg.shards,
        flush_interval = ?cfg.flush_interval,
        backends = cfg.backends.len(),
        "statspipe started"
    );

    cancel.cancelled().await;

    // Drain in-flight events before tearing the pipeline down.
    handler.wait_for_events().await;
    if let Err(e) = flusher_task.await {
        tracing::warn!(error = %e, "flusher task join failed");
    }

    tracing::info!("statspipe stopped");
    Ok(())
}
