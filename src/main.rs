// Main entry point - Dependency injection and sync loop setup
mod domain;
mod application;
mod infrastructure;
mod presentation;

use std::{net::SocketAddr, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::{signal, sync::watch};

use crate::application::history_service::HistoryService;
use crate::application::retention_store::RetentionStore;
use crate::application::sync_service::SyncOrchestrator;
use crate::application::telemetry_source::TelemetrySource;
use crate::infrastructure::config::{load_sync_config, load_tank_overrides, StoreBackend, SyncConfig};
use crate::infrastructure::http_source::HttpTelemetrySource;
use crate::infrastructure::memory_store::MemoryRetentionStore;
use crate::infrastructure::rest_store::RestRetentionStore;
use crate::presentation::app_state::AppState;
use crate::presentation::handlers::router;

#[derive(Parser)]
#[command(name = "fuel-tank-sync")]
#[command(about = "Sync fuel tank telemetry and predict depletion")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync, cleanup and health loops until interrupted (default)
    Run,

    /// Import historical readings for every tank, then exit
    Backfill {
        /// Days of history to import
        #[arg(long, default_value_t = 5)]
        days: u32,
    },

    /// Print a tank's history window as JSON
    History {
        #[arg(long)]
        site: String,

        #[arg(long)]
        tank: String,

        /// Lookback window in hours
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run().await,
        Command::Backfill { days } => backfill(days).await,
        Command::History { site, tank, hours } => history(&site, &tank, hours).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn build_source(config: &SyncConfig) -> anyhow::Result<Arc<dyn TelemetrySource>> {
    let source = HttpTelemetrySource::new(
        config.tank_api_url.clone(),
        config.http_timeout(),
        config.upstream_max_retries,
    )?;
    Ok(Arc::new(source))
}

fn build_store(config: &SyncConfig) -> anyhow::Result<Arc<dyn RetentionStore>> {
    match config.store_backend {
        StoreBackend::Rest => {
            let store = RestRetentionStore::new(
                config.store_url.clone(),
                config.store_service_key.clone(),
                config.cleanup_procedure.clone(),
                config.http_timeout(),
            )?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory retention store, nothing will be persisted");
            Ok(Arc::new(MemoryRetentionStore::new()))
        }
    }
}

fn build_orchestrator(config: &SyncConfig) -> anyhow::Result<Arc<SyncOrchestrator>> {
    let overrides = load_tank_overrides()?;
    if !overrides.is_empty() {
        tracing::info!(tanks = overrides.len(), "Loaded per-tank overrides");
    }

    Ok(Arc::new(SyncOrchestrator::new(
        build_source(config)?,
        build_store(config)?,
        config.sync_settings(overrides),
    )))
}

async fn run() -> anyhow::Result<()> {
    let config = load_sync_config()?;
    let orchestrator = build_orchestrator(&config)?;
    orchestrator.start().await?;

    let (stop_tx, stop_rx) = watch::channel(false);

    let status_server = if config.status_addr.trim().is_empty() {
        None
    } else {
        let addr: SocketAddr = config
            .status_addr
            .parse()
            .with_context(|| format!("Invalid STATUS_ADDR {}", config.status_addr))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind status endpoint on {}", addr))?;
        let app = router(Arc::new(AppState {
            orchestrator: orchestrator.clone(),
        }));
        tracing::info!("Status endpoint listening on {}", addr);

        let stopped = wait_for_stop(stop_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stopped).await {
                tracing::error!("Status endpoint failed: {}", e);
            }
        }))
    };

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    orchestrator.run(wait_for_stop(stop_rx)).await;

    if let Some(server) = status_server {
        let _ = server.await;
    }
    tracing::info!("Sync service stopped");
    Ok(())
}

async fn backfill(days: u32) -> anyhow::Result<()> {
    let config = load_sync_config()?;
    let orchestrator = build_orchestrator(&config)?;
    orchestrator.start().await?;

    let summary = orchestrator.backfill(days).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn history(site: &str, tank: &str, hours: u32) -> anyhow::Result<()> {
    let config = load_sync_config()?;
    let service = HistoryService::new(build_source(&config)?);

    let window = service.load(site, tank, hours).await?;
    println!("{}", serde_json::to_string_pretty(&window)?);
    Ok(())
}

async fn wait_for_stop(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}
