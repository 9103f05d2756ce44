//! Phase job definitions.
//!
//! A [`PhaseJob`] is the recurring unit of work bound to one (event, phase)
//! pair. It owns its own stall clock, so a job and its inactivity state live
//! and die together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use super::gateway::LiveResults;
use super::inactivity::{Activity, InactivityMonitor};
use crate::error::Result;

/// Event identifier.
pub type EventId = u32;

/// Event phase identifier.
pub type PhaseId = u32;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity of a phase job. At most one job exists per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub event_id: EventId,
    pub phase_id: PhaseId,
}

impl JobKey {
    pub fn new(event_id: EventId, phase_id: PhaseId) -> Self {
        Self { event_id, phase_id }
    }

    /// Stable textual job id.
    pub fn job_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "interim_results_event_{}_phase_{}",
            self.event_id, self.phase_id
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tick Results
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of one successful tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub job_id: String,
    pub event_id: EventId,
    pub phase_id: PhaseId,
    /// 1-based tick counter for this job
    pub tick: u64,
    pub rows_affected: u64,
    pub activity: Activity,
}

/// Point-in-time view of a registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub event_id: EventId,
    pub phase_id: PhaseId,
    pub created_at: DateTime<Utc>,
    pub interval_secs: u64,
    pub ticks: u64,
    pub failed_ticks: u64,
    pub last_rows_affected: Option<u64>,
    pub idle_secs: u64,
    #[serde(skip)]
    pub last_effective_update: Instant,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Phase Job
// ═══════════════════════════════════════════════════════════════════════════════

/// One actively monitored event phase.
#[derive(Debug)]
pub struct PhaseJob {
    key: JobKey,
    interval: Duration,
    monitor: InactivityMonitor,
    created_at: DateTime<Utc>,
    ticks: u64,
    failed_ticks: u64,
    last_rows_affected: Option<u64>,
}

impl PhaseJob {
    /// Create a job whose stall clock starts now.
    pub fn new(key: JobKey, interval: Duration, stall_threshold: Duration) -> Self {
        Self {
            key,
            interval,
            monitor: InactivityMonitor::new(Instant::now(), stall_threshold),
            created_at: Utc::now(),
            ticks: 0,
            failed_ticks: 0,
            last_rows_affected: None,
        }
    }

    pub fn key(&self) -> JobKey {
        self.key
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_effective_update(&self) -> Instant {
        self.monitor.last_effective_update()
    }

    /// Run one aggregation and classify it.
    ///
    /// A failed aggregation leaves the stall clock untouched.
    pub async fn run(&mut self, results: &dyn LiveResults) -> Result<TickReport> {
        self.ticks += 1;

        let rows = match results.aggregate(self.key.event_id, self.key.phase_id).await {
            Ok(rows) => rows,
            Err(e) => {
                self.failed_ticks += 1;
                return Err(e);
            }
        };

        let activity = self.monitor.observe(rows, Instant::now());
        self.last_rows_affected = Some(rows);

        Ok(TickReport {
            job_id: self.key.job_id(),
            event_id: self.key.event_id,
            phase_id: self.key.phase_id,
            tick: self.ticks,
            rows_affected: rows,
            activity,
        })
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let last_effective_update = self.monitor.last_effective_update();
        JobSnapshot {
            job_id: self.key.job_id(),
            event_id: self.key.event_id,
            phase_id: self.key.phase_id,
            created_at: self.created_at,
            interval_secs: self.interval.as_secs(),
            ticks: self.ticks,
            failed_ticks: self.failed_ticks,
            last_rows_affected: self.last_rows_affected,
            idle_secs: self.monitor.idle_for(Instant::now()).as_secs(),
            last_effective_update,
        }
    }
}
