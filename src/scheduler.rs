//! Retry scheduling for idempotent background jobs.
//!
//! The engine hands the scheduler units of work that report whether they are
//! done. A job returning `false` is retried later; a job returning `true` has
//! either succeeded or decided that retrying is pointless (for example because
//! its subscriber went inactive). Jobs are identified by key, and submitting a
//! key that is already running is a no-op, so resubmission is always safe.
//!
//! [`TokioScheduler`] runs each job in its own task and backs off exponentially
//! between attempts:
//! - Attempt 1: initial delay
//! - Attempt 2: 2x initial delay
//! - ... up to the configured maximum
//!
//! Each delay has ±25% jitter to prevent a fleet of processes from retrying in
//! lockstep.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// An idempotent, re-submittable unit of work.
#[async_trait]
pub trait RetryableJob: Send + Sync {
    /// Stable identity used to de-duplicate submissions.
    fn key(&self) -> String;

    /// Run one attempt.
    ///
    /// Returns `true` when the job is finished and `false` to be retried.
    async fn run(&self) -> bool;
}

/// Accepts retryable jobs.
pub trait JobScheduler: Send + Sync {
    /// Submit `job`; duplicates of a running key are ignored.
    fn submit(&self, job: Arc<dyn RetryableJob>);
}

/// [`JobScheduler`] backed by tokio tasks with exponential backoff.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    running: Arc<Mutex<HashSet<String>>>,
    initial_delay: Duration,
    max_delay: Duration,
}

impl TokioScheduler {
    /// Creates a scheduler with the given backoff bounds.
    #[must_use]
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            running: Arc::new(Mutex::new(HashSet::new())),
            initial_delay,
            max_delay,
        }
    }

    /// Whether a job with `key` is currently running.
    #[must_use]
    pub fn is_running(&self, key: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Number of jobs currently running.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl JobScheduler for TokioScheduler {
    fn submit(&self, job: Arc<dyn RetryableJob>) {
        let key = job.key();
        {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            if !running.insert(key.clone()) {
                debug!(job = %key, "Job already scheduled, ignoring resubmission");
                return;
            }
        }

        let running = Arc::clone(&self.running);
        let initial_delay = self.initial_delay;
        let max_delay = self.max_delay;

        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            let mut delay = initial_delay;

            loop {
                attempt += 1;
                if job.run().await {
                    info!(job = %key, attempt, "Job finished");
                    break;
                }

                warn!(job = %key, attempt, ?delay, "Job attempt failed, retrying");
                tokio::time::sleep(delay).await;
                delay = next_delay(delay, max_delay);
            }

            running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
        });
    }
}

/// Double `delay` up to `max`, then apply ±25% jitter.
fn next_delay(delay: Duration, max: Duration) -> Duration {
    let doubled = std::cmp::min(delay.saturating_mul(2), max);

    let jitter_factor = 0.25 * (rand::random::<f64>() - 0.5) * 2.0;
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let jitter_ms = (doubled.as_millis() as f64 * jitter_factor).round() as i64;

    if jitter_ms >= 0 {
        doubled + Duration::from_millis(jitter_ms.unsigned_abs())
    } else {
        doubled.saturating_sub(Duration::from_millis(jitter_ms.unsigned_abs()))
    }
}
