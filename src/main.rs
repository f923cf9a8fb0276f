use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use beamsync::config::Config;
use beamsync::coordinator::Coordinator;
use beamsync::export::api::{ApiServer, TableHandles};
use beamsync::export::health::HealthMetrics;
use beamsync::export::{MemoryStatusSink, MemoryTableSink};
use beamsync::source::sim::SimConnector;
use beamsync::source::{Connector, NullConnector};
use beamsync::table::TableSink;

/// Beam synchronous acquisition service.
#[derive(Parser)]
#[command(name = "beamsync", about)]
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
        println!("beamsync {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    cfg.apply_tunables();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        tables = cfg.tables.len(),
        "starting beamsync",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let metrics = Arc::new(HealthMetrics::new().context("creating health metrics")?);

    // Signal transport: built-in simulation or silent columns.
    let sim = if cfg.source.sim.enabled {
        let sim = Arc::new(SimConnector::new(
            cfg.source.sim.rate_hz,
            cfg.source.sim.dropout_period,
        ));
        sim.start();
        Some(sim)
    } else {
        None
    };
    let connector: Arc<dyn Connector> = match &sim {
        Some(sim) => Arc::clone(sim) as Arc<dyn Connector>,
        None => Arc::new(NullConnector),
    };

    // One coordinator triple per configured table.
    let mut coordinators = Vec::with_capacity(cfg.tables.len());
    let mut handles = Vec::with_capacity(cfg.tables.len());
    for table in &cfg.tables {
        let table_sink = MemoryTableSink::new();
        let status_sink = MemoryStatusSink::new();

        let coordinator = Arc::new(
            Coordinator::new(
                table.prefix.clone(),
                table.signals.clone(),
                Arc::clone(&connector),
                Arc::clone(&table_sink) as Arc<dyn TableSink>,
                Arc::clone(&status_sink) as Arc<dyn beamsync::export::StatusSink>,
                Some(Arc::clone(&metrics)),
            )
            .with_context(|| format!("creating coordinator for {}", table.prefix))?,
        );

        handles.push(TableHandles {
            coordinator: Arc::clone(&coordinator),
            table: table_sink,
            status: status_sink,
        });
        coordinators.push(coordinator);
    }

    let api = ApiServer::new(&cfg.api.addr, Arc::clone(&metrics), handles);
    api.start().await.context("starting api server")?;

    let _ = shutdown_rx.await;

    // Graceful shutdown: sources stop producing first, then the tables.
    if let Some(sim) = &sim {
        sim.stop();
    }
    for coordinator in &coordinators {
        coordinator.close();
    }
    api.stop().await;

    tracing::info!("beamsync stopped");

    Ok(())
}
