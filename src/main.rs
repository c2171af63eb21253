//! hostbridge - runs an external controller script against a host
//!
//! The binary drives the built-in simulated host; the library crate carries the
//! bridge itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hostbridge::gateway::TcpGateway;
use hostbridge::host::{Host, HostLog, SimHost};
use hostbridge::supervisor::Supervisor;
use hostbridge::{Bridge, BridgeConfig};

/// Bridge a host's observer API to an external controller script
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "HOSTBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Controller script, overrides script.path
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// First RPC port to try, overrides gateway.port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("Starting hostbridge v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;
    run(config, shutdown_signal()).await?;

    info!("hostbridge shutdown complete");
    Ok(())
}

async fn load_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Configuration file: {}", path.display());
            BridgeConfig::load(path).await?
        }
        None => {
            info!("No configuration file, using defaults");
            BridgeConfig::default()
        }
    };

    if let Some(script) = &args.script {
        config.script.path = Some(script.clone());
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run(config: BridgeConfig, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
    let host = Arc::new(SimHost::new(&config.sim));
    let (bridge, scheduler) = Bridge::new(host.clone(), &config)?;
    info!(tracks = bridge.track_bank().len(), "Bridge initialized");

    let gateway = TcpGateway::new(bridge.clone(), config.gateway.call_timeout());
    let mut supervisor = match Supervisor::start(&config, &gateway, host.clone()).await {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!("Startup failed: {}", e);
            host.errorln(&format!("hostbridge: {}", e));
            host.show_notification(&e.to_string());
            return Err(e.into());
        }
    };

    let ticker = scheduler.start(config.scheduler.period());
    info!(port = supervisor.port(), "Ready, waiting for the script to register");

    tokio::pin!(shutdown);
    let mut exit_check = tokio::time::interval(Duration::from_secs(1));
    let mut exit_reported = false;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = exit_check.tick() => {
                if !exit_reported && supervisor.has_exited() {
                    warn!("Script exited on its own, bridge keeps running");
                    exit_reported = true;
                }
            }
        }
    }

    // Order matters: no tick may call into the script while it is stopping
    info!("Shutting down...");
    let stats = ticker.stop().await;
    info!(
        ticks = stats.ticks,
        deliveries = stats.deliveries,
        midi_events = stats.midi_events,
        "Scheduler stopped"
    );

    if bridge.unregister_consumer().await {
        info!("Consumer stopped");
    }

    if let Some(outcome) = supervisor.shutdown().await {
        info!(?outcome, "Script supervisor shut down");
    }

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false),
        )
        .init();

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    info!("Shutdown signal received");
}
