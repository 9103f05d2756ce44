//! Interval scheduling of phase jobs.
//!
//! Every registered job gets its own timer task. Within one job ticks run
//! strictly one after another: the timer awaits a tick before waiting for the
//! next one, and manual triggers take the same per-job lock. Different jobs
//! tick concurrently.
//!
//! Stopping a job cancels its timer. A tick that is already running finishes,
//! after which the timer exits.
//!
//! Replacing a job (or stopping and restarting it) does not wait for the old
//! timer. Both registrations share one tick lock per key instead, so the new
//! timer's first tick queues behind a tick the old one is still running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::gateway::LiveResults;
use super::job::{EventId, JobKey, JobSnapshot, PhaseId, PhaseJob, TickReport};
use crate::config::SchedulerConfig;
use crate::error::{LaplinkError, Result};

type SharedJob = Arc<tokio::sync::Mutex<PhaseJob>>;

/// Serializes ticks of one key across registrations.
type TickLock = Arc<tokio::sync::Mutex<()>>;

struct JobEntry {
    generation: u64,
    cancel: CancellationToken,
    job: SharedJob,
    tick_lock: TickLock,
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<JobKey, JobEntry>,
    /// Held weakly: a lock lives as long as an entry or a timer task uses it.
    tick_locks: HashMap<JobKey, Weak<tokio::sync::Mutex<()>>>,
    started: bool,
    shut_down: bool,
}

impl Registry {
    /// The tick lock for `key`, shared with any timer of the key still running.
    fn tick_lock(&mut self, key: JobKey) -> TickLock {
        if let Some(lock) = self.tick_locks.get(&key).and_then(Weak::upgrade) {
            return lock;
        }
        self.tick_locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = TickLock::default();
        self.tick_locks.insert(key, Arc::downgrade(&lock));
        lock
    }
}

/// Counters exposed through [`JobScheduler::stats`].
#[derive(Debug, Default)]
struct SchedulerCounters {
    started: AtomicU64,
    replaced: AtomicU64,
    stopped: AtomicU64,
    retired: AtomicU64,
    ticks: AtomicU64,
    failed_ticks: AtomicU64,
}

/// Scheduler statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub registered: usize,
    pub started: u64,
    pub replaced: u64,
    pub stopped: u64,
    pub retired: u64,
    pub ticks: u64,
    pub failed_ticks: u64,
}

struct SchedulerInner {
    config: SchedulerConfig,
    results: Arc<dyn LiveResults>,
    registry: Mutex<Registry>,
    root: CancellationToken,
    tasks: TaskTracker,
    next_generation: AtomicU64,
    counters: SchedulerCounters,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

/// Owns the registry of live phase jobs and drives their timers.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    /// Create an idle scheduler. Timers start with the first registration.
    pub fn new(config: SchedulerConfig, results: Arc<dyn LiveResults>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                results,
                registry: Mutex::new(Registry::default()),
                root: CancellationToken::new(),
                tasks: TaskTracker::new(),
                next_generation: AtomicU64::new(1),
                counters: SchedulerCounters::default(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Register a job for `(event_id, phase_id)`, replacing any existing one.
    ///
    /// The old timer is cancelled before the new one is installed, under the
    /// registry lock, so a key never maps to two live timers.
    pub fn start(&self, event_id: EventId, phase_id: PhaseId) -> Result<()> {
        let key = JobKey::new(event_id, phase_id);
        let config = &self.inner.config;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let job = Arc::new(tokio::sync::Mutex::new(PhaseJob::new(
            key,
            config.tick_interval,
            config.stall_threshold,
        )));

        let mut registry = self.inner.registry.lock();
        if registry.shut_down {
            return Err(LaplinkError::scheduler_shutdown());
        }
        if !registry.started {
            registry.started = true;
            tracing::info!(
                tick_interval_secs = config.tick_interval.as_secs(),
                stall_threshold_secs = config.stall_threshold.as_secs(),
                "Live results scheduler started"
            );
        }

        let cancel = self.inner.root.child_token();
        let tick_lock = registry.tick_lock(key);
        if let Some(previous) = registry.jobs.insert(
            key,
            JobEntry {
                generation,
                cancel: cancel.clone(),
                job: Arc::clone(&job),
                tick_lock: Arc::clone(&tick_lock),
            },
        ) {
            previous.cancel.cancel();
            self.inner.counters.replaced.fetch_add(1, Ordering::Relaxed);
            tracing::info!(job_id = %key, event_id, phase_id, "Replaced existing phase job");
        } else {
            tracing::info!(job_id = %key, event_id, phase_id, "Scheduled phase job");
        }
        self.inner.counters.started.fetch_add(1, Ordering::Relaxed);

        self.inner.tasks.spawn(drive(
            Arc::downgrade(&self.inner),
            key,
            generation,
            job,
            tick_lock,
            cancel,
        ));
        Ok(())
    }

    /// Cancel and remove the job for `(event_id, phase_id)`.
    ///
    /// Returns whether a job was registered; stopping an absent job is a no-op.
    pub fn stop(&self, event_id: EventId, phase_id: PhaseId) -> bool {
        let key = JobKey::new(event_id, phase_id);
        let removed = self.inner.registry.lock().jobs.remove(&key);

        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                self.inner.counters.stopped.fetch_add(1, Ordering::Relaxed);
                tracing::info!(job_id = %key, event_id, phase_id, "Stopped phase job");
                true
            }
            None => {
                tracing::debug!(job_id = %key, "No phase job to stop");
                false
            }
        }
    }

    /// Run one tick of a registered job now.
    ///
    /// Waits for an in-flight tick of the same key, including one still run by
    /// a replaced registration. Returns `Ok(None)` when no job is registered for
    /// the key, or it was stopped while we waited.
    pub async fn trigger(&self, event_id: EventId, phase_id: PhaseId) -> Result<Option<TickReport>> {
        let key = JobKey::new(event_id, phase_id);
        let (generation, cancel, job, tick_lock) = match self.inner.registry.lock().jobs.get(&key) {
            Some(entry) => (
                entry.generation,
                entry.cancel.clone(),
                Arc::clone(&entry.job),
                Arc::clone(&entry.tick_lock),
            ),
            None => return Ok(None),
        };

        let _turn = tick_lock.lock().await;
        let mut job = job.lock().await;
        if cancel.is_cancelled() {
            return Ok(None);
        }
        tracing::info!(job_id = %key, "Manual tick requested");
        self.inner.tick(key, generation, &mut job).await.map(Some)
    }

    /// Whether a job is registered for the key.
    pub fn is_scheduled(&self, event_id: EventId, phase_id: PhaseId) -> bool {
        self.inner
            .registry
            .lock()
            .jobs
            .contains_key(&JobKey::new(event_id, phase_id))
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<JobKey> {
        let mut keys: Vec<JobKey> = self.inner.registry.lock().jobs.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Number of registered jobs.
    pub fn len(&self) -> usize {
        self.inner.registry.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one job. Waits for an in-flight tick of that job.
    pub async fn snapshot(&self, event_id: EventId, phase_id: PhaseId) -> Option<JobSnapshot> {
        let job = self
            .inner
            .registry
            .lock()
            .jobs
            .get(&JobKey::new(event_id, phase_id))
            .map(|entry| Arc::clone(&entry.job))?;
        let snapshot = job.lock().await.snapshot();
        Some(snapshot)
    }

    /// Snapshots of every registered job, sorted by key.
    pub async fn snapshots(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<(JobKey, SharedJob)> = self
            .inner
            .registry
            .lock()
            .jobs
            .iter()
            .map(|(key, entry)| (*key, Arc::clone(&entry.job)))
            .collect();
        jobs.sort_by_key(|(key, _)| *key);

        let mut snapshots = Vec::with_capacity(jobs.len());
        for (_, job) in jobs {
            snapshots.push(job.lock().await.snapshot());
        }
        snapshots
    }

    /// Get scheduler statistics.
    pub fn stats(&self) -> SchedulerStats {
        let counters = &self.inner.counters;
        SchedulerStats {
            registered: self.len(),
            started: counters.started.load(Ordering::Relaxed),
            replaced: counters.replaced.load(Ordering::Relaxed),
            stopped: counters.stopped.load(Ordering::Relaxed),
            retired: counters.retired.load(Ordering::Relaxed),
            ticks: counters.ticks.load(Ordering::Relaxed),
            failed_ticks: counters.failed_ticks.load(Ordering::Relaxed),
        }
    }

    /// Cancel every job and wait for in-flight ticks to finish.
    ///
    /// Later registrations fail with `SchedulerShutdown`. Idempotent.
    pub async fn shutdown(&self) {
        let drained = {
            let mut registry = self.inner.registry.lock();
            registry.shut_down = true;
            registry.jobs.drain().count()
        };
        self.inner.root.cancel();
        self.inner.tasks.close();

        tracing::info!(jobs = drained, "Live results scheduler shutting down");
        self.inner.tasks.wait().await;
        tracing::info!("Live results scheduler stopped");
    }
}

impl SchedulerInner {
    /// One tick of `job`, followed by retirement when the phase has stalled.
    async fn tick(&self, key: JobKey, generation: u64, job: &mut PhaseJob) -> Result<TickReport> {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);

        let report = match job.run(self.results.as_ref()).await {
            Ok(report) => report,
            Err(e) => {
                self.counters.failed_ticks.fetch_add(1, Ordering::Relaxed);
                counter!("laplink_job_ticks_total", "outcome" => "failed").increment(1);
                return Err(e);
            }
        };
        counter!("laplink_job_ticks_total", "outcome" => "ok").increment(1);

        tracing::debug!(
            job_id = %key,
            tick = report.tick,
            rows_affected = report.rows_affected,
            activity = ?report.activity,
            "Phase job tick finished"
        );

        if report.activity.is_stalled() {
            self.retire(key, generation).await;
        }
        Ok(report)
    }

    /// Remove the stalled job and force its event into the terminal phase.
    ///
    /// Only the registration that detected the stall can retire itself, so the
    /// forced write happens at most once per stall episode.
    async fn retire(&self, key: JobKey, generation: u64) {
        let removed = {
            let mut registry = self.registry.lock();
            match registry.jobs.get(&key) {
                Some(entry) if entry.generation == generation => registry.jobs.remove(&key),
                _ => None,
            }
        };
        let Some(entry) = removed else {
            tracing::debug!(job_id = %key, "Stalled job already stopped; skipping retirement");
            return;
        };
        entry.cancel.cancel();
        self.counters.retired.fetch_add(1, Ordering::Relaxed);
        counter!("laplink_job_retirements_total").increment(1);

        let terminal = self.config.terminal_phase;
        tracing::warn!(
            job_id = %key,
            event_id = key.event_id,
            phase_id = key.phase_id,
            terminal_phase = terminal,
            stall_threshold_secs = self.config.stall_threshold.as_secs(),
            "Phase stalled; closing results"
        );

        match self.results.force_phase(key.event_id, terminal).await {
            Ok(()) => {
                tracing::info!(job_id = %key, terminal_phase = terminal, "Event moved to terminal phase");
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(job_id = %key, "Event no longer exists; nothing to close");
            }
            Err(e) => {
                tracing::error!(
                    job_id = %key,
                    error = %e,
                    "Forced phase transition failed; re-trigger the phase change manually"
                );
            }
        }
    }
}

/// Timer loop for one job registration.
async fn drive(
    inner: Weak<SchedulerInner>,
    key: JobKey,
    generation: u64,
    job: SharedJob,
    tick_lock: TickLock,
    cancel: CancellationToken,
) {
    let period = match inner.upgrade() {
        Some(inner) => inner.config.tick_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let _turn = tick_lock.lock().await;
        let mut guard = job.lock().await;
        if cancel.is_cancelled() {
            break;
        }
        let Some(scheduler) = inner.upgrade() else {
            break;
        };

        if let Err(e) = scheduler.tick(key, generation, &mut guard).await {
            tracing::error!(
                job_id = %key,
                error_code = %e.code(),
                error = %e,
                "Phase job tick failed"
            );
        }
    }

    tracing::debug!(job_id = %key, generation, "Phase job timer exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Quiet;

    #[async_trait]
    impl LiveResults for Quiet {
        async fn aggregate(&self, _event_id: EventId, _phase_id: PhaseId) -> Result<u64> {
            Ok(1)
        }

        async fn force_phase(&self, _event_id: EventId, _phase_id: PhaseId) -> Result<()> {
            Ok(())
        }
    }

    fn scheduler() -> JobScheduler {
        JobScheduler::new(SchedulerConfig::default(), Arc::new(Quiet))
    }

    #[tokio::test]
    async fn test_start_is_upsert() {
        let scheduler = scheduler();
        scheduler.start(1, 1).unwrap();
        scheduler.start(1, 1).unwrap();
        scheduler.start(1, 2).unwrap();

        assert_eq!(scheduler.keys(), vec![JobKey::new(1, 1), JobKey::new(1, 2)]);
        let stats = scheduler.stats();
        assert_eq!(stats.started, 3);
        assert_eq!(stats.replaced, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_absent_is_noop() {
        let scheduler = scheduler();
        assert!(!scheduler.stop(9, 9));
        scheduler.start(9, 1).unwrap();
        assert!(scheduler.stop(9, 1));
        assert!(!scheduler.stop(9, 1));
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.stats().stopped, 1);
    }

    #[tokio::test]
    async fn test_start_after_shutdown_fails() {
        let scheduler = scheduler();
        scheduler.start(3, 1).unwrap();
        scheduler.shutdown().await;
        scheduler.shutdown().await;

        assert!(scheduler.is_empty());
        let err = scheduler.start(3, 1).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::SchedulerShutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_absent_job() {
        let scheduler = scheduler();
        assert!(scheduler.trigger(5, 2).await.unwrap().is_none());

        scheduler.start(5, 2).unwrap();
        let report = scheduler.trigger(5, 2).await.unwrap().unwrap();
        assert_eq!(report.tick, 1);
        assert_eq!(report.rows_affected, 1);

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(scheduler.snapshot(5, 2).await.unwrap().ticks, 2);
        scheduler.shutdown().await;
    }
}
