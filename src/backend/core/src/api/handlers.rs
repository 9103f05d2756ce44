//! API request handlers with proper error propagation.
//!
//! Handlers return `Result<impl IntoResponse, LaplinkError>` so that errors
//! are converted to HTTP status codes via the `IntoResponse` implementation on
//! `LaplinkError`.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use super::{ApiResponse, AppState};
use crate::db::BrokerStats;
use crate::error::LaplinkError;
use crate::jobs::{EventId, JobKey, JobSnapshot, PhaseChange, PhaseId, SchedulerStats};

// ═══════════════════════════════════════════════════════════════════════════════
// Health Check
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: String,
    pub scheduler: SchedulerStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker: Option<BrokerStats>,
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
        scheduler: state.scheduler().stats(),
        broker: state.broker_stats(),
    })
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Phase Results
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct EventPhaseQuery {
    pub event_id: EventId,
    pub event_phase_id: PhaseId,
}

impl EventPhaseQuery {
    fn key(&self) -> JobKey {
        JobKey::new(self.event_id, self.event_phase_id)
    }
}

#[derive(Debug, Serialize)]
pub struct JobStarted {
    pub job_id: String,
    pub event_id: EventId,
    pub phase_id: PhaseId,
}

#[derive(Debug, Serialize)]
pub struct JobStopped {
    pub job_id: String,
    pub removed: bool,
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub jobs: Vec<JobSnapshot>,
    pub stats: SchedulerStats,
}

pub async fn start_event_update(
    State(state): State<AppState>,
    Query(query): Query<EventPhaseQuery>,
) -> Result<impl IntoResponse, LaplinkError> {
    state.scheduler().start(query.event_id, query.event_phase_id)?;

    Ok(Json(ApiResponse::success(JobStarted {
        job_id: query.key().job_id(),
        event_id: query.event_id,
        phase_id: query.event_phase_id,
    })))
}

pub async fn stop_event_update(
    State(state): State<AppState>,
    Query(query): Query<EventPhaseQuery>,
) -> impl IntoResponse {
    let removed = state.scheduler().stop(query.event_id, query.event_phase_id);

    Json(ApiResponse::success(JobStopped {
        job_id: query.key().job_id(),
        removed,
    }))
}

pub async fn manual_update_event_results(
    State(state): State<AppState>,
    Query(query): Query<EventPhaseQuery>,
) -> Result<impl IntoResponse, LaplinkError> {
    let report = state
        .scheduler()
        .trigger(query.event_id, query.event_phase_id)
        .await?
        .ok_or_else(|| LaplinkError::not_found("Phase job", query.key().job_id()))?;

    Ok(Json(ApiResponse::success(report)))
}

pub async fn phase_changed(
    State(state): State<AppState>,
    Json(change): Json<PhaseChange>,
) -> Result<impl IntoResponse, LaplinkError> {
    let outcome = state.controller.apply(change)?;
    Ok(Json(ApiResponse::success(outcome)))
}

pub async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    let scheduler = state.scheduler();
    Json(ApiResponse::success(JobList {
        jobs: scheduler.snapshots().await,
        stats: scheduler.stats(),
    }))
}
