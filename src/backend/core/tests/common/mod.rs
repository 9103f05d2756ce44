//! Shared test doubles for the live results core.

#![allow(dead_code)]

use async_trait::async_trait;
use laplink_core::config::SchedulerConfig;
use laplink_core::error::{LaplinkError, Result};
use laplink_core::jobs::{EventId, JobScheduler, LiveResults, PhaseId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scriptable results store.
///
/// Aggregation returns scripted row counts per (event, phase), then
/// `default_rows` once the script runs out.
#[derive(Default)]
pub struct FakeResults {
    scripts: Mutex<HashMap<(EventId, PhaseId), VecDeque<u64>>>,
    default_rows: Mutex<u64>,
    delay: Mutex<Option<Duration>>,
    failing: AtomicBool,
    event_missing: AtomicBool,
    calls: AtomicUsize,
    completed: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    forced: Mutex<Vec<(EventId, PhaseId)>>,
}

impl FakeResults {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, event_id: EventId, phase_id: PhaseId, rows: impl IntoIterator<Item = u64>) {
        self.scripts
            .lock()
            .entry((event_id, phase_id))
            .or_default()
            .extend(rows);
    }

    pub fn set_default_rows(&self, rows: u64) {
        *self.default_rows.lock() = rows;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_event_missing(&self, missing: bool) {
        self.event_missing.store(missing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn forced(&self) -> Vec<(EventId, PhaseId)> {
        self.forced.lock().clone()
    }
}

#[async_trait]
impl LiveResults for FakeResults {
    async fn aggregate(&self, event_id: EventId, phase_id: PhaseId) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(LaplinkError::dependency_failure(
                "Result aggregation",
                "Deadlock found when trying to get lock",
            ));
        }

        let scripted = self
            .scripts
            .lock()
            .get_mut(&(event_id, phase_id))
            .and_then(VecDeque::pop_front);
        Ok(scripted.unwrap_or(*self.default_rows.lock()))
    }

    async fn force_phase(&self, event_id: EventId, phase_id: PhaseId) -> Result<()> {
        if self.event_missing.load(Ordering::SeqCst) {
            return Err(LaplinkError::not_found("Event", event_id.to_string()));
        }
        self.forced.lock().push((event_id, phase_id));
        Ok(())
    }
}

/// Scheduler over `results` with production timings.
pub fn scheduler(results: &Arc<FakeResults>) -> JobScheduler {
    JobScheduler::new(SchedulerConfig::default(), results.clone())
}

pub fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}
