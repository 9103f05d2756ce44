//! Stall detection for a live phase.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Classification of one aggregation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Activity {
    /// Rows changed; the stall clock was reset.
    Effective,
    /// Nothing changed, still within the threshold.
    Quiet { idle_secs: u64 },
    /// Nothing changed for longer than the threshold.
    Stalled { idle_secs: u64 },
}

impl Activity {
    pub fn is_stalled(&self) -> bool {
        matches!(self, Self::Stalled { .. })
    }
}

/// Tracks the last time aggregation changed anything.
#[derive(Debug, Clone)]
pub struct InactivityMonitor {
    last_effective_update: Instant,
    threshold: Duration,
}

impl InactivityMonitor {
    /// Start the stall clock at `started_at`.
    pub fn new(started_at: Instant, threshold: Duration) -> Self {
        Self {
            last_effective_update: started_at,
            threshold,
        }
    }

    /// Record the rows affected by a tick that finished at `now`.
    pub fn observe(&mut self, rows_affected: u64, now: Instant) -> Activity {
        if rows_affected > 0 {
            self.last_effective_update = now;
            return Activity::Effective;
        }

        let idle = self.idle_for(now);
        if idle > self.threshold {
            Activity::Stalled {
                idle_secs: idle.as_secs(),
            }
        } else {
            Activity::Quiet {
                idle_secs: idle.as_secs(),
            }
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_effective_update)
    }

    pub fn last_effective_update(&self) -> Instant {
        self.last_effective_update
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: Duration = Duration::from_secs(90 * 60);

    #[test]
    fn test_rows_reset_clock() {
        let start = Instant::now();
        let mut monitor = InactivityMonitor::new(start, THRESHOLD);

        let later = start + Duration::from_secs(600);
        assert_eq!(monitor.observe(3, later), Activity::Effective);
        assert_eq!(monitor.last_effective_update(), later);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let start = Instant::now();
        let mut monitor = InactivityMonitor::new(start, THRESHOLD);

        assert_eq!(
            monitor.observe(0, start + THRESHOLD),
            Activity::Quiet { idle_secs: 5400 }
        );
        assert!(monitor
            .observe(0, start + THRESHOLD + Duration::from_secs(1))
            .is_stalled());
    }

    #[test]
    fn test_stall_counts_from_reset() {
        let start = Instant::now();
        let mut monitor = InactivityMonitor::new(start, THRESHOLD);
        let reset = start + Duration::from_secs(50 * 60);
        monitor.observe(1, reset);

        let at_91_minutes = start + Duration::from_secs(91 * 60);
        assert!(!monitor.observe(0, at_91_minutes).is_stalled());
        assert!(monitor
            .observe(0, reset + Duration::from_secs(91 * 60))
            .is_stalled());
    }
}
