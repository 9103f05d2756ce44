//! Connection Broker - hands out a fixed set of database connections by priority.
//!
//! The `ConnectionBroker` provides:
//! - A bounded pool: the connections it is built with are the only ones it hands out
//! - Two FIFO wait queues, `High` served before `Low` on every release
//! - A wait budget after which acquisition fails with `ResourceExhausted`
//! - A guard that returns the connection to the broker when dropped
//!
//! Priority is best effort. A low ticket is served only when the high queue is
//! empty at the moment a connection comes back, so a steady stream of high
//! requests can keep low requests waiting until their budget runs out.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{LaplinkError, Result};

/// Priority of a connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Latency-sensitive writes
    High,
    /// Best-effort reads
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending request for a connection.
struct Ticket<C> {
    priority: Priority,
    enqueued_at: Instant,
    grant: oneshot::Sender<C>,
}

impl<C> Ticket<C> {
    /// The requester gave up (budget elapsed or future dropped).
    fn is_abandoned(&self) -> bool {
        self.grant.is_closed()
    }
}

struct BrokerState<C> {
    idle: Vec<C>,
    high: VecDeque<Ticket<C>>,
    low: VecDeque<Ticket<C>>,
    closed: bool,
}

impl<C> BrokerState<C> {
    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<Ticket<C>> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Low => &mut self.low,
        }
    }

    fn next_ticket(&mut self) -> Option<Ticket<C>> {
        if let Some(ticket) = self.high.pop_front() {
            return Some(ticket);
        }
        self.low.pop_front()
    }

    fn live_waiters(&self, priority: Priority) -> usize {
        let queue = match priority {
            Priority::High => &self.high,
            Priority::Low => &self.low,
        };
        queue.iter().filter(|t| !t.is_abandoned()).count()
    }
}

#[derive(Default)]
struct BrokerCounters {
    outstanding: AtomicUsize,
    granted_high: AtomicU64,
    granted_low: AtomicU64,
    timeouts: AtomicU64,
    total_wait_us: AtomicU64,
}

struct Shared<C> {
    name: String,
    pool_size: usize,
    state: Mutex<BrokerState<C>>,
    counters: BrokerCounters,
}

impl<C: Send + 'static> Shared<C> {
    /// Hand `conn` to the oldest live high ticket, else the oldest live low
    /// ticket, else park it as idle.
    fn release(&self, conn: C) {
        self.counters.outstanding.fetch_sub(1, Ordering::AcqRel);

        let mut conn = conn;
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        while let Some(ticket) = state.next_ticket() {
            let queued_for = ticket.enqueued_at.elapsed();
            let priority = ticket.priority;
            match ticket.grant.send(conn) {
                Ok(()) => {
                    self.counters.outstanding.fetch_add(1, Ordering::AcqRel);
                    histogram!(
                        "laplink_broker_queue_wait_seconds",
                        "pool" => self.name.clone(),
                        "priority" => priority.as_str(),
                    )
                    .record(queued_for.as_secs_f64());
                    drop(state);
                    self.publish_gauges();
                    return;
                }
                Err(returned) => conn = returned,
            }
        }
        state.idle.push(conn);
        drop(state);
        self.publish_gauges();
    }

    fn publish_gauges(&self) {
        let outstanding = self.counters.outstanding.load(Ordering::Acquire);
        gauge!("laplink_broker_outstanding", "pool" => self.name.clone()).set(outstanding as f64);
        gauge!("laplink_broker_available", "pool" => self.name.clone())
            .set(self.pool_size.saturating_sub(outstanding) as f64);
    }
}

/// Snapshot of broker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub name: String,
    pub pool_size: usize,
    pub idle: usize,
    pub outstanding: usize,
    pub waiting_high: usize,
    pub waiting_low: usize,
    pub granted_high: u64,
    pub granted_low: u64,
    pub timeouts: u64,
    pub avg_wait_us: u64,
}

/// Arbitrates access to a fixed set of connections between high and low priority callers.
pub struct ConnectionBroker<C> {
    shared: Arc<Shared<C>>,
    wait_budget: Duration,
}

impl<C> Clone for ConnectionBroker<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            wait_budget: self.wait_budget,
        }
    }
}

impl<C: Send + 'static> ConnectionBroker<C> {
    /// Create a broker owning `connections`.
    pub fn new(name: impl Into<String>, connections: Vec<C>, wait_budget: Duration) -> Self {
        let name = name.into();
        let pool_size = connections.len();

        tracing::info!(
            pool_name = %name,
            pool_size,
            wait_budget_ms = wait_budget.as_millis() as u64,
            "Connection broker created"
        );

        let shared = Arc::new(Shared {
            name,
            pool_size,
            state: Mutex::new(BrokerState {
                idle: connections,
                high: VecDeque::new(),
                low: VecDeque::new(),
                closed: false,
            }),
            counters: BrokerCounters::default(),
        });
        shared.publish_gauges();

        Self { shared, wait_budget }
    }

    /// Get the broker name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of connections the broker was built with.
    pub fn pool_size(&self) -> usize {
        self.shared.pool_size
    }

    /// Default wait budget for `acquire`.
    pub fn wait_budget(&self) -> Duration {
        self.wait_budget
    }

    /// Acquire a connection, waiting at most the configured budget.
    pub async fn acquire(&self, priority: Priority) -> Result<BrokeredConnection<C>> {
        self.acquire_with_budget(priority, self.wait_budget).await
    }

    /// Acquire a connection, waiting at most `budget`.
    pub async fn acquire_with_budget(
        &self,
        priority: Priority,
        budget: Duration,
    ) -> Result<BrokeredConnection<C>> {
        let start = Instant::now();

        let mut grant = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(LaplinkError::pool_closed(&self.shared.name));
            }
            // Releases serve live tickets before parking a connection, so an
            // idle connection means nobody is waiting ahead of us.
            if let Some(conn) = state.idle.pop() {
                drop(state);
                return Ok(self.grant(conn, priority, start));
            }
            let (tx, rx) = oneshot::channel();
            state.queue_mut(priority).push_back(Ticket {
                priority,
                enqueued_at: start,
                grant: tx,
            });
            PendingGrant {
                rx,
                shared: Arc::clone(&self.shared),
            }
        };

        tracing::trace!(
            pool_name = %self.shared.name,
            priority = %priority,
            "Waiting for a connection"
        );

        match tokio::time::timeout(budget, &mut grant.rx).await {
            Ok(Ok(conn)) => Ok(self.wrap(conn, priority, start)),
            Ok(Err(_)) => Err(LaplinkError::pool_closed(&self.shared.name)),
            Err(_) => {
                // A release may have handed us a connection right as the budget ran out.
                if let Some(conn) = grant.withdraw() {
                    return Ok(self.wrap(conn, priority, start));
                }

                self.shared.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                counter!(
                    "laplink_broker_timeouts_total",
                    "pool" => self.shared.name.clone(),
                    "priority" => priority.as_str(),
                )
                .increment(1);
                tracing::warn!(
                    pool_name = %self.shared.name,
                    priority = %priority,
                    wait_ms = start.elapsed().as_millis() as u64,
                    "Connection acquire timed out"
                );
                Err(LaplinkError::resource_exhausted(
                    &self.shared.name,
                    budget.as_millis() as u64,
                ))
            }
        }
    }

    /// Take an idle connection without waiting.
    pub fn try_acquire(&self, priority: Priority) -> Option<BrokeredConnection<C>> {
        let start = Instant::now();
        let conn = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return None;
            }
            state.idle.pop()?
        };
        Some(self.grant(conn, priority, start))
    }

    /// Return a connection to the broker. Equivalent to dropping the guard.
    pub fn release(&self, conn: BrokeredConnection<C>) {
        drop(conn);
    }

    /// Number of live tickets waiting at `priority`.
    pub fn waiting(&self, priority: Priority) -> usize {
        self.shared.state.lock().live_waiters(priority)
    }

    /// Close the broker: pending and future acquisitions fail with `PoolClosed`,
    /// connections released afterwards are dropped. Returns the idle connections.
    pub fn close(&self) -> Vec<C> {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.high.clear();
        state.low.clear();
        let idle = std::mem::take(&mut state.idle);

        tracing::info!(
            pool_name = %self.shared.name,
            returned = idle.len(),
            "Connection broker closed"
        );
        idle
    }

    /// Get broker statistics.
    pub fn stats(&self) -> BrokerStats {
        let (idle, waiting_high, waiting_low) = {
            let state = self.shared.state.lock();
            (
                state.idle.len(),
                state.live_waiters(Priority::High),
                state.live_waiters(Priority::Low),
            )
        };
        let counters = &self.shared.counters;
        let granted_high = counters.granted_high.load(Ordering::Relaxed);
        let granted_low = counters.granted_low.load(Ordering::Relaxed);
        let granted = granted_high + granted_low;

        BrokerStats {
            name: self.shared.name.clone(),
            pool_size: self.shared.pool_size,
            idle,
            outstanding: counters.outstanding.load(Ordering::Acquire),
            waiting_high,
            waiting_low,
            granted_high,
            granted_low,
            timeouts: counters.timeouts.load(Ordering::Relaxed),
            avg_wait_us: if granted > 0 {
                counters.total_wait_us.load(Ordering::Relaxed) / granted
            } else {
                0
            },
        }
    }

    /// Account for a connection taken straight from the idle set.
    fn grant(&self, conn: C, priority: Priority, start: Instant) -> BrokeredConnection<C> {
        self.shared.counters.outstanding.fetch_add(1, Ordering::AcqRel);
        self.shared.publish_gauges();
        self.wrap(conn, priority, start)
    }

    /// Wrap a connection already counted as outstanding.
    fn wrap(&self, conn: C, priority: Priority, start: Instant) -> BrokeredConnection<C> {
        let counters = &self.shared.counters;
        let wait = start.elapsed();
        counters
            .total_wait_us
            .fetch_add(wait.as_micros() as u64, Ordering::Relaxed);
        match priority {
            Priority::High => counters.granted_high.fetch_add(1, Ordering::Relaxed),
            Priority::Low => counters.granted_low.fetch_add(1, Ordering::Relaxed),
        };

        tracing::debug!(
            pool_name = %self.shared.name,
            priority = %priority,
            wait_ms = wait.as_millis() as u64,
            "Connection acquired"
        );

        BrokeredConnection {
            conn: Some(conn),
            shared: Arc::clone(&self.shared),
            priority,
        }
    }
}

/// Receiving end of a queued ticket.
///
/// If the acquiring future is dropped after a release already sent it a
/// connection, the connection goes back to the broker instead of being lost.
struct PendingGrant<C: Send + 'static> {
    rx: oneshot::Receiver<C>,
    shared: Arc<Shared<C>>,
}

impl<C: Send + 'static> PendingGrant<C> {
    /// Give up the ticket, returning a connection that was granted meanwhile.
    fn withdraw(&mut self) -> Option<C> {
        self.rx.close();
        self.rx.try_recv().ok()
    }
}

impl<C: Send + 'static> Drop for PendingGrant<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.withdraw() {
            self.shared.release(conn);
        }
    }
}

/// A connection on loan from the broker, returned when dropped.
pub struct BrokeredConnection<C: Send + 'static> {
    conn: Option<C>,
    shared: Arc<Shared<C>>,
    priority: Priority,
}

impl<C: Send + 'static> BrokeredConnection<C> {
    /// Priority the connection was acquired with.
    pub fn priority(&self) -> Priority {
        self.priority
    }
}

impl<C: Send + 'static> Deref for BrokeredConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl<C: Send + 'static> DerefMut for BrokeredConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl<C: Send + 'static> Drop for BrokeredConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.release(conn);
        }
    }
}

impl<C: Send + 'static> fmt::Debug for BrokeredConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokeredConnection")
            .field("pool", &self.shared.name)
            .field("priority", &self.priority)
            .finish()
    }
}
