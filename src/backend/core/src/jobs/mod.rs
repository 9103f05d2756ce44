//! Live results jobs for Laplink.
//!
//! While an event phase is running, its interim standings are recomputed on a
//! fixed interval by a dedicated job:
//!
//! - **Job**: one recurring aggregation bound to an (event, phase) pair
//! - **Scheduler**: one timer per job, no overlap within a job, upsert semantics
//! - **Inactivity**: closes results when a phase stops changing
//! - **Gateway**: runs the aggregation procedure on high-priority connections
//! - **Transition**: maps event phase changes onto the scheduler
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ PhaseTransition  │────▶│ JobScheduler │────▶│   PhaseJob   │────▶│ Aggregation  │
//! │   Controller     │     │  (timers)    │     │ + Inactivity │     │   Gateway    │
//! └──────────────────┘     └──────────────┘     └──────────────┘     └──────┬───────┘
//!                                 ▲                    │                    │
//!                                 └──── retire ────────┘                    ▼
//!                                                                  ConnectionBroker
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use laplink_core::jobs::{AggregationGateway, JobScheduler, PhaseTransitionController};
//!
//! let gateway = Arc::new(AggregationGateway::new(db.broker().clone()));
//! let scheduler = JobScheduler::new(config.scheduler.clone(), gateway);
//! let controller = PhaseTransitionController::new(scheduler.clone());
//!
//! controller.on_phase_changed(42, 1, 2)?;
//! ```

pub mod gateway;
pub mod inactivity;
pub mod job;
pub mod scheduler;
pub mod transition;

pub use gateway::{AggregationGateway, LiveResults, ResultsConnection};
pub use inactivity::{Activity, InactivityMonitor};
pub use job::{EventId, JobKey, JobSnapshot, PhaseId, PhaseJob, TickReport};
pub use scheduler::{JobScheduler, SchedulerStats};
pub use transition::{PhaseChange, PhaseTransitionController, TransitionOutcome};
