//! Laplink Server - Main entry point
//!
//! Live interim results for running events.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use laplink_core::{
    api::{self, AppState},
    config::Config,
    db::Database,
    jobs::{AggregationGateway, JobScheduler, PhaseTransitionController},
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::load().context("Failed to load configuration")?;

    let telemetry = telemetry::init_telemetry(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.observability.environment,
        "Starting Laplink Server"
    );

    let db = Database::connect(&config.database).await?;
    tracing::info!(
        pool_size = config.database.pool_size,
        acquire_timeout_secs = config.database.acquire_timeout.as_secs(),
        "Connected to database"
    );

    let gateway = Arc::new(AggregationGateway::new(db.broker().clone()));
    let scheduler = JobScheduler::new(config.scheduler.clone(), gateway);
    let controller = PhaseTransitionController::new(scheduler.clone());

    let app_state = AppState::new(controller, telemetry.metrics.clone()).with_broker(db.broker().clone());
    let app = api::build_router(app_state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    scheduler.shutdown().await;
    db.close().await;
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
