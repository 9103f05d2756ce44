#![allow(clippy::result_large_err)]
//! # Laplink Core
//!
//! Live interim results for running events.
//!
//! ## Architecture
//!
//! - **Connection Broker**: fixed set of database sessions shared by priority, high before low
//! - **Phase Jobs**: one recurring aggregation per running (event, phase)
//! - **Scheduler**: interval timers with per-job non-overlap and upsert registration
//! - **Inactivity**: closes results for phases that stop changing
//! - **Transitions**: maps event phase changes onto the scheduler
//! - **API**: thin HTTP trigger surface
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, LaplinkError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, SchedulerConfig};
    pub use crate::db::{BrokerStats, BrokeredConnection, ConnectionBroker, Database, Priority};
    pub use crate::error::{ErrorCode, ErrorDetails, ErrorSeverity, LaplinkError, Result};
    pub use crate::jobs::{
        Activity, AggregationGateway, EventId, JobKey, JobScheduler, JobSnapshot, LiveResults,
        PhaseChange, PhaseId, PhaseTransitionController, ResultsConnection, TickReport,
        TransitionOutcome,
    };
}
