//! Calls into the results store: the aggregation procedure and the forced phase write.

use async_trait::async_trait;

use super::{EventId, PhaseId};
use crate::db::{BrokeredConnection, ConnectionBroker, Priority};
use crate::error::{LaplinkError, Result};

/// Operations the live results core needs from one database session.
///
/// Implemented for [`crate::db::MySqlSession`].
#[async_trait]
pub trait ResultsConnection: Send + 'static {
    /// Open a transaction.
    async fn begin(&mut self) -> Result<()>;

    /// Run the aggregation procedure for one event phase, returning rows affected.
    async fn call_aggregate(&mut self, event_id: EventId, phase_id: PhaseId) -> Result<u64>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> Result<()>;

    /// Set the event's current phase, returning rows affected.
    async fn write_phase(&mut self, event_id: EventId, phase_id: PhaseId) -> Result<u64>;
}

/// What a phase job needs from the outside world.
#[async_trait]
pub trait LiveResults: Send + Sync + 'static {
    /// Recompute standings for one event phase; returns rows affected.
    async fn aggregate(&self, event_id: EventId, phase_id: PhaseId) -> Result<u64>;

    /// Force an event into `phase_id`. Fails with `RecordNotFound` when the event is gone.
    async fn force_phase(&self, event_id: EventId, phase_id: PhaseId) -> Result<()>;
}

/// Runs the aggregation procedure on high-priority brokered connections.
pub struct AggregationGateway<C> {
    broker: ConnectionBroker<C>,
}

impl<C: ResultsConnection> AggregationGateway<C> {
    pub fn new(broker: ConnectionBroker<C>) -> Self {
        Self { broker }
    }

    /// Get the underlying broker.
    pub fn broker(&self) -> &ConnectionBroker<C> {
        &self.broker
    }

    /// Aggregate inside a transaction.
    ///
    /// If this future is dropped while the transaction is open, the rollback
    /// runs on a spawned task and the connection returns to the broker after it.
    pub async fn run(&self, event_id: EventId, phase_id: PhaseId) -> Result<u64> {
        let conn = self.broker.acquire(Priority::High).await?;
        let mut tx = OpenTransaction::begin(conn, event_id, phase_id).await?;

        let rows = match tx.conn_mut().call_aggregate(event_id, phase_id).await {
            Ok(rows) => rows,
            Err(e) => {
                tx.rollback().await;
                return Err(aggregation_failed(event_id, phase_id, e));
            }
        };
        tx.commit().await?;

        tracing::debug!(event_id, phase_id, rows_affected = rows, "Interim results updated");
        Ok(rows)
    }

    /// Write `phase_id` on a fresh high-priority connection.
    pub async fn write_phase(&self, event_id: EventId, phase_id: PhaseId) -> Result<()> {
        let mut conn = self.broker.acquire(Priority::High).await?;

        let rows = conn.write_phase(event_id, phase_id).await.map_err(|e| {
            LaplinkError::dependency_failure("Event phase write", e.to_string())
                .with_context("event_id", event_id)
                .with_context("phase_id", phase_id)
                .with_source(e)
        })?;

        if rows == 0 {
            return Err(LaplinkError::not_found("Event", event_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<C: ResultsConnection> LiveResults for AggregationGateway<C> {
    async fn aggregate(&self, event_id: EventId, phase_id: PhaseId) -> Result<u64> {
        self.run(event_id, phase_id).await
    }

    async fn force_phase(&self, event_id: EventId, phase_id: PhaseId) -> Result<()> {
        self.write_phase(event_id, phase_id).await
    }
}

fn aggregation_failed(event_id: EventId, phase_id: PhaseId, cause: LaplinkError) -> LaplinkError {
    LaplinkError::dependency_failure("Result aggregation", cause.to_string())
        .with_context("event_id", event_id)
        .with_context("phase_id", phase_id)
        .with_source(cause)
}

async fn rollback_quietly<C: ResultsConnection>(conn: &mut C, event_id: EventId, phase_id: PhaseId) {
    if let Err(e) = conn.rollback().await {
        tracing::warn!(event_id, phase_id, error = %e, "Rollback of aggregation transaction failed");
    }
}

/// A transaction open on a brokered connection.
struct OpenTransaction<C: ResultsConnection> {
    conn: Option<BrokeredConnection<C>>,
    event_id: EventId,
    phase_id: PhaseId,
    settled: bool,
}

impl<C: ResultsConnection> OpenTransaction<C> {
    async fn begin(conn: BrokeredConnection<C>, event_id: EventId, phase_id: PhaseId) -> Result<Self> {
        let mut tx = Self {
            conn: Some(conn),
            event_id,
            phase_id,
            settled: false,
        };
        if let Err(e) = tx.conn_mut().begin().await {
            tx.settled = true;
            return Err(aggregation_failed(event_id, phase_id, e));
        }
        Ok(tx)
    }

    fn conn_mut(&mut self) -> &mut C {
        self.conn
            .as_deref_mut()
            .expect("connection is held until the transaction settles")
    }

    async fn commit(mut self) -> Result<()> {
        let (event_id, phase_id) = (self.event_id, self.phase_id);
        let result = self.conn_mut().commit().await;
        if let Err(e) = result {
            rollback_quietly(self.conn_mut(), event_id, phase_id).await;
            self.settled = true;
            return Err(aggregation_failed(event_id, phase_id, e));
        }
        self.settled = true;
        Ok(())
    }

    async fn rollback(mut self) {
        let (event_id, phase_id) = (self.event_id, self.phase_id);
        rollback_quietly(self.conn_mut(), event_id, phase_id).await;
        self.settled = true;
    }
}

impl<C: ResultsConnection> Drop for OpenTransaction<C> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let (event_id, phase_id) = (self.event_id, self.phase_id);
        tracing::warn!(event_id, phase_id, "Aggregation cancelled with its transaction open; rolling back");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    rollback_quietly(&mut *conn, event_id, phase_id).await;
                });
            }
            Err(_) => tracing::error!(
                event_id,
                phase_id,
                "No runtime to roll back on; the session must discard the transaction on next use"
            ),
        }
    }
}
