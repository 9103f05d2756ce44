//! HTTP trigger surface for Laplink.
//!
//! A thin axum router over the live results core. The event management layer
//! calls these endpoints when operators start, stop or edit an event:
//!
//! - `GET  /health`
//! - `GET  /metrics`
//! - `POST /phase-results/start-event-update?event_id=&event_phase_id=`
//! - `POST /phase-results/stop-event-update?event_id=&event_phase_id=`
//! - `POST /phase-results/manual-update-event-results?event_id=&event_phase_id=`
//! - `POST /phase-results/phase-changed`
//! - `GET  /phase-results/jobs`

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::db::{BrokerStats, ConnectionBroker};
use crate::jobs::{JobScheduler, PhaseTransitionController};
use crate::telemetry::MetricsRegistry;

type BrokerStatsFn = Arc<dyn Fn() -> BrokerStats + Send + Sync>;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: PhaseTransitionController,
    pub metrics: MetricsRegistry,
    broker_stats: Option<BrokerStatsFn>,
}

impl AppState {
    pub fn new(controller: PhaseTransitionController, metrics: MetricsRegistry) -> Self {
        Self {
            controller,
            metrics,
            broker_stats: None,
        }
    }

    /// Report this broker's statistics from `/health`.
    pub fn with_broker<C: Send + 'static>(mut self, broker: ConnectionBroker<C>) -> Self {
        self.broker_stats = Some(Arc::new(move || broker.stats()));
        self
    }

    pub fn scheduler(&self) -> &JobScheduler {
        self.controller.scheduler()
    }

    pub fn broker_stats(&self) -> Option<BrokerStats> {
        self.broker_stats.as_ref().map(|stats| stats())
    }
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let phase_results = Router::new()
        .route("/start-event-update", post(handlers::start_event_update))
        .route("/stop-event-update", post(handlers::stop_event_update))
        .route(
            "/manual-update-event-results",
            post(handlers::manual_update_event_results),
        )
        .route("/phase-changed", post(handlers::phase_changed))
        .route("/jobs", get(handlers::list_jobs));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .nest("/phase-results", phase_results)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// API response wrapper. Errors are rendered by [`crate::error::ErrorResponse`].
#[derive(Debug, serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}
