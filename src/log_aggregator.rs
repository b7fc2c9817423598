//! Count-and-flush aggregation for log messages that repeat under churn.
//!
//! Slave processes may schedule cache refreshes for hundreds of subscribers per
//! second. Logging each one floods the output, so the engine records them here
//! and one summary line per key is emitted once the window has elapsed.
//!
//! Summaries are emitted by [`LogAggregator::record`] when an event arrives
//! after the window, and by the background task started with
//! [`LogAggregator::spawn_flusher`] when events stop arriving.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Lower bound for the flusher's tick period.
const MIN_FLUSH_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Pending {
    message: &'static str,
    count: u64,
    since: Instant,
}

/// Aggregates repeated log events per key over a fixed window.
#[derive(Debug)]
pub struct LogAggregator {
    window: Duration,
    pending: Mutex<HashMap<String, Pending>>,
}

impl LogAggregator {
    /// Create an aggregator flushing every `window`.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Count one occurrence of `message` under `key`.
    ///
    /// When the window for `key` has elapsed, emits one summary line and
    /// returns the number of occurrences it covered.
    pub fn record(&self, key: &str, message: &'static str) -> Option<u64> {
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        let entry = pending.entry(key.to_string()).or_insert(Pending {
            message,
            count: 0,
            since: now,
        });
        entry.count += 1;

        if now.duration_since(entry.since) < self.window {
            return None;
        }

        let count = entry.count;
        info!(key, count, window_secs = self.window.as_secs(), "{}", entry.message);
        pending.remove(key);
        Some(count)
    }

    /// Emit a summary for every key with pending occurrences.
    ///
    /// Returns the total number of occurrences flushed.
    pub fn flush(&self) -> u64 {
        let drained: Vec<(String, Pending)> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        drained
            .into_iter()
            .map(|(key, p)| {
                info!(key = %key, count = p.count, "{}", p.message);
                p.count
            })
            .sum()
    }

    /// Emit a summary for every key whose window has elapsed.
    ///
    /// Returns the number of occurrences flushed.
    pub fn flush_due(&self) -> u64 {
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let due: Vec<String> = pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.since) >= self.window)
            .map(|(key, _)| key.clone())
            .collect();

        due.iter()
            .filter_map(|key| pending.remove(key).map(|p| (key, p)))
            .map(|(key, p)| {
                info!(key = %key, count = p.count, window_secs = self.window.as_secs(), "{}", p.message);
                p.count
            })
            .sum()
    }

    /// Flush due summaries every window in a background task.
    ///
    /// The task holds a weak reference and ends once the aggregator is dropped.
    /// Must be called from within a tokio runtime.
    pub fn spawn_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let aggregator = Arc::downgrade(self);
        let period = self.window.max(MIN_FLUSH_PERIOD);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(aggregator) = aggregator.upgrade() else {
                    debug!("Log aggregator dropped, flusher stopping");
                    break;
                };
                aggregator.flush_due();
            }
        })
    }

    /// Occurrences currently waiting for `key`.
    #[must_use]
    pub fn pending_count(&self, key: &str) -> u64 {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, |p| p.count)
    }
}

impl Default for LogAggregator {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_within_window() {
        let aggregator = LogAggregator::new(Duration::from_secs(3600));

        for _ in 0..5 {
            assert_eq!(aggregator.record("refresh", "Scheduled cache refreshes"), None);
        }
        assert_eq!(aggregator.pending_count("refresh"), 5);
        assert_eq!(aggregator.pending_count("other"), 0);
    }

    #[test]
    fn test_zero_window_flushes_every_event() {
        let aggregator = LogAggregator::new(Duration::ZERO);

        assert_eq!(aggregator.record("refresh", "Scheduled cache refreshes"), Some(1));
        assert_eq!(aggregator.pending_count("refresh"), 0);
    }

    #[test]
    fn test_flush_drains_all_keys() {
        let aggregator = LogAggregator::new(Duration::from_secs(3600));
        aggregator.record("a", "A happened");
        aggregator.record("a", "A happened");
        aggregator.record("b", "B happened");

        assert_eq!(aggregator.flush(), 3);
        assert_eq!(aggregator.pending_count("a"), 0);
        assert_eq!(aggregator.flush(), 0);
    }

    #[test]
    fn test_flush_due_keeps_young_keys() {
        let aggregator = LogAggregator::new(Duration::from_secs(3600));
        aggregator.record("young", "Still counting");

        assert_eq!(aggregator.flush_due(), 0);
        assert_eq!(aggregator.pending_count("young"), 1);
    }

    #[tokio::test]
    async fn test_flusher_drains_single_event() {
        let aggregator = Arc::new(LogAggregator::new(Duration::from_millis(20)));
        let flusher = aggregator.spawn_flusher();

        assert_eq!(aggregator.record("refresh", "Scheduled cache refreshes"), None);

        let mut drained = false;
        for _ in 0..100 {
            if aggregator.pending_count("refresh") == 0 {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(drained);

        drop(aggregator);
        let stopped = tokio::time::timeout(Duration::from_secs(1), flusher).await;
        assert!(matches!(stopped, Ok(Ok(()))));
    }
}
