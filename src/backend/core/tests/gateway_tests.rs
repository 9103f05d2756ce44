//! Tests for aggregation transactions on brokered connections.
//!
//! Covers cancellation: a caller that gives up mid-aggregation must not hand a
//! session with an open transaction back to the broker.

use async_trait::async_trait;
use laplink_core::db::{ConnectionBroker, Priority};
use laplink_core::jobs::{AggregationGateway, EventId, PhaseId, ResultsConnection};
use laplink_core::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Records every statement and sleeps through the aggregation procedure.
struct SlowSession {
    journal: Arc<Mutex<Vec<&'static str>>>,
    aggregate_delay: Duration,
}

#[async_trait]
impl ResultsConnection for SlowSession {
    async fn begin(&mut self) -> Result<()> {
        self.journal.lock().push("begin");
        Ok(())
    }

    async fn call_aggregate(&mut self, _event_id: EventId, _phase_id: PhaseId) -> Result<u64> {
        self.journal.lock().push("aggregate");
        sleep(self.aggregate_delay).await;
        self.journal.lock().push("aggregate_done");
        Ok(2)
    }

    async fn commit(&mut self) -> Result<()> {
        self.journal.lock().push("commit");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.journal.lock().push("rollback");
        Ok(())
    }

    async fn write_phase(&mut self, _event_id: EventId, _phase_id: PhaseId) -> Result<u64> {
        self.journal.lock().push("write_phase");
        Ok(1)
    }
}

fn gateway(aggregate_delay: Duration) -> (AggregationGateway<SlowSession>, Arc<Mutex<Vec<&'static str>>>) {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let session = SlowSession {
        journal: Arc::clone(&journal),
        aggregate_delay,
    };
    let broker = ConnectionBroker::new("gateway-tests", vec![session], Duration::from_secs(60));
    (AggregationGateway::new(broker), journal)
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_run_rolls_back_before_release() {
    let (gateway, journal) = gateway(Duration::from_secs(10));

    assert!(timeout(Duration::from_secs(1), gateway.run(42, 2)).await.is_err());

    // The session is still out on loan to the rollback task.
    assert_eq!(gateway.broker().stats().idle, 0);

    sleep(Duration::from_millis(1)).await;
    assert_eq!(*journal.lock(), vec!["begin", "aggregate", "rollback"]);
    let stats = gateway.broker().stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.outstanding, 0);
}

#[tokio::test(start_paused = true)]
async fn test_next_run_after_cancellation_starts_clean() {
    let (gateway, journal) = gateway(Duration::from_secs(10));
    assert!(timeout(Duration::from_secs(1), gateway.run(42, 2)).await.is_err());

    // Queued behind the rollback task for the only session.
    assert_eq!(gateway.run(42, 2).await.unwrap(), 2);
    assert_eq!(
        *journal.lock(),
        vec!["begin", "aggregate", "rollback", "begin", "aggregate", "aggregate_done", "commit"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_manual_tick_leaves_no_open_transaction() {
    use laplink_core::config::SchedulerConfig;
    use laplink_core::jobs::JobScheduler;

    let (gateway, journal) = gateway(Duration::from_secs(10));
    let gateway = Arc::new(gateway);
    let scheduler = JobScheduler::new(SchedulerConfig::default(), gateway.clone());
    scheduler.start(42, 2).unwrap();

    // A client that disconnects drops the trigger future mid-aggregation.
    assert!(timeout(Duration::from_secs(1), scheduler.trigger(42, 2)).await.is_err());
    sleep(Duration::from_millis(1)).await;

    assert_eq!(*journal.lock(), vec!["begin", "aggregate", "rollback"]);
    assert_eq!(gateway.broker().stats().idle, 1);
    assert!(gateway.broker().try_acquire(Priority::Low).is_some());
    scheduler.shutdown().await;
}
