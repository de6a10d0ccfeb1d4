//! CLI entry point for the screw-robot fleet simulator.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use screwsim::{
    config::ConfigState,
    export::{export_historical, ExportOptions},
    fleet::FleetOrchestrator,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "screwsim")]
#[command(about = "Industrial screw-robot fleet telemetry simulator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream live telemetry for the whole fleet until interrupted
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "sim.env")]
        config: PathBuf,
    },

    /// Generate historical telemetry offline and write it to CSV
    Export {
        /// Path to the configuration file
        #[arg(short, long, default_value = "sim.env")]
        config: PathBuf,

        /// Number of devices
        #[arg(short, long, default_value = "10")]
        devices: usize,

        /// Number of days to generate data for
        #[arg(short = 'D', long, default_value = "30")]
        days: i64,

        /// Interval between operations in minutes
        #[arg(short, long, default_value = "1")]
        interval_minutes: i64,

        /// Output CSV file
        #[arg(short, long, default_value = "historical_telemetry.csv")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::Export {
            config,
            devices,
            days,
            interval_minutes,
            output,
        } => {
            let config_state = load_config(&config)?;
            init_logging(&config_state.current().log_level)?;

            let opts = ExportOptions {
                num_devices: devices,
                days_back: days,
                interval_minutes,
                output,
            };
            let summary = export_historical(&config_state.current(), &opts)?;
            info!(records = summary.records_written, "export finished");
            Ok(())
        }
    }
}

async fn run(config_path: PathBuf) -> Result<()> {
    let config_state = load_config(&config_path)?;
    let snapshot = config_state.current();
    init_logging(&snapshot.log_level)?;

    info!(
        config = %config_path.display(),
        hostname = %snapshot.hostname,
        devices = snapshot.num_devices,
        interval_secs = snapshot.interval_secs,
        jitter_secs = snapshot.jitter_secs,
        anomaly_rate = snapshot.anomaly_rate,
        degradation = snapshot.enable_degradation,
        "simulator starting"
    );

    let shutdown = CancellationToken::new();

    // Handle shutdown gracefully (SIGINT and SIGTERM)
    let shutdown_for_handler = shutdown.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("SIGINT received, shutting down gracefully...");
            }
            _ = terminate => {
                info!("SIGTERM received, shutting down gracefully...");
            }
        }

        shutdown_for_handler.cancel();
    });

    let summary = FleetOrchestrator::new(config_state, shutdown).run().await;

    info!(
        completed = summary.completed,
        failed = summary.failed,
        "simulator stopped"
    );
    if summary.failed > 0 {
        anyhow::bail!("{} device(s) terminated with fatal errors", summary.failed);
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<Arc<ConfigState>> {
    let state = ConfigState::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    Ok(Arc::new(state))
}

/// `RUST_LOG` wins when set; otherwise the configured level applies.
fn init_logging(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("invalid log level")?;
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
    Ok(())
}
