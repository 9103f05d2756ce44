//! Phase change handling.

use serde::{Deserialize, Serialize};

use super::job::{EventId, JobKey, PhaseId};
use super::scheduler::JobScheduler;
use crate::error::Result;

/// A phase change reported by the event management layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseChange {
    pub event_id: EventId,
    pub old_phase_id: PhaseId,
    pub new_phase_id: PhaseId,
}

/// What a phase change did to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransitionOutcome {
    /// Job for the old phase, if one was running.
    pub stopped: Option<JobKey>,
    /// Job for the new phase, if the new phase is active.
    pub started: Option<JobKey>,
}

/// Turns event phase changes into scheduler actions.
#[derive(Clone)]
pub struct PhaseTransitionController {
    scheduler: JobScheduler,
    active_phases: Vec<PhaseId>,
}

impl PhaseTransitionController {
    /// Use the scheduler's configured active phases.
    pub fn new(scheduler: JobScheduler) -> Self {
        let active_phases = scheduler.config().active_phases.clone();
        Self::with_active_phases(scheduler, active_phases)
    }

    pub fn with_active_phases(scheduler: JobScheduler, active_phases: Vec<PhaseId>) -> Self {
        Self {
            scheduler,
            active_phases,
        }
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn is_active(&self, phase_id: PhaseId) -> bool {
        self.active_phases.contains(&phase_id)
    }

    /// Stop the old phase's job and start one for the new phase when it is active.
    ///
    /// Calling this twice with the same arguments leaves the same jobs registered.
    pub fn on_phase_changed(
        &self,
        event_id: EventId,
        old_phase_id: PhaseId,
        new_phase_id: PhaseId,
    ) -> Result<TransitionOutcome> {
        let mut outcome = TransitionOutcome::default();

        if self.scheduler.stop(event_id, old_phase_id) {
            outcome.stopped = Some(JobKey::new(event_id, old_phase_id));
        }

        if self.is_active(new_phase_id) {
            self.scheduler.start(event_id, new_phase_id)?;
            outcome.started = Some(JobKey::new(event_id, new_phase_id));
        }

        tracing::info!(
            event_id,
            old_phase_id,
            new_phase_id,
            stopped = outcome.stopped.is_some(),
            started = outcome.started.is_some(),
            "Event phase changed"
        );
        Ok(outcome)
    }

    pub fn apply(&self, change: PhaseChange) -> Result<TransitionOutcome> {
        self.on_phase_changed(change.event_id, change.old_phase_id, change.new_phase_id)
    }

    /// Stop the job for a deleted event's current phase.
    pub fn on_event_deleted(&self, event_id: EventId, phase_id: PhaseId) -> bool {
        let stopped = self.scheduler.stop(event_id, phase_id);
        tracing::info!(event_id, phase_id, stopped, "Event deleted");
        stopped
    }
}
