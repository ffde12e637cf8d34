//! Queue metrics and telemetry.
//!
//! Counters are plain atomics; the trailing failure window sits behind a
//! mutex and is pruned whenever it is read or written.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of outcome samples kept for the failure window.
const MAX_OUTCOME_SAMPLES: usize = 10_000;

/// Queue metrics collector shared by every component of one process.
#[derive(Debug)]
pub struct QueueMetrics {
    /// Jobs admitted by `enqueue`.
    pub enqueued: AtomicU64,
    /// Submissions collapsed onto an existing idempotency record.
    pub duplicates: AtomicU64,
    /// Submissions or runs turned away by the limiter.
    pub throttled: AtomicU64,
    /// Handler runs that succeeded.
    pub completed: AtomicU64,
    /// Handler runs that failed.
    pub failed: AtomicU64,
    /// Jobs resubmitted by startup recovery.
    pub recovered: AtomicU64,
    /// Limiter tokens granted.
    pub tokens_acquired: AtomicU64,
    /// Limiter acquisitions that timed out.
    pub limiter_timeouts: AtomicU64,
    /// Timestamped handler outcomes, `true` meaning success.
    outcomes: Mutex<VecDeque<(DateTime<Utc>, bool)>>,
    /// Width of the trailing failure-rate window.
    window: Duration,
}

impl QueueMetrics {
    /// Create a collector whose failure rate looks back over `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            tokens_acquired: AtomicU64::new(0),
            limiter_timeouts: AtomicU64::new(0),
            outcomes: Mutex::new(VecDeque::new()),
            window,
        }
    }

    /// Record an admitted job.
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a duplicate submission.
    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a throttled submission or run.
    pub fn record_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a recovered job.
    pub fn record_recovered(&self) {
        self.recovered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a granted limiter token.
    pub fn record_token_acquired(&self) {
        self.tokens_acquired.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a limiter timeout.
    pub fn record_limiter_timeout(&self) {
        self.limiter_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful handler run.
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.record_outcome_at(true, Utc::now());
    }

    /// Record a failed handler run.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_outcome_at(false, Utc::now());
    }

    /// Add a handler outcome observed at `at` to the failure window.
    pub fn record_outcome_at(&self, success: bool, at: DateTime<Utc>) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            if outcomes.len() >= MAX_OUTCOME_SAMPLES {
                outcomes.pop_front();
            }
            outcomes.push_back((at, success));
        }
    }

    /// Failure rate over the trailing window ending at `now`.
    ///
    /// Returns `None` until at least `min_samples` outcomes fall inside the window.
    pub fn failure_rate_at(&self, now: DateTime<Utc>, min_samples: usize) -> Option<f64> {
        let Ok(mut outcomes) = self.outcomes.lock() else {
            return None;
        };
        let cutoff = now - self.window;
        while outcomes.front().is_some_and(|(at, _)| *at < cutoff) {
            outcomes.pop_front();
        }

        let total = outcomes.len();
        if total == 0 || total < min_samples {
            return None;
        }
        let failures = outcomes.iter().filter(|(_, success)| !success).count();
        Some(failures as f64 / total as f64)
    }

    /// Get the current snapshot of metrics.
    pub fn snapshot(&self, min_samples: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            tokens_acquired: self.tokens_acquired.load(Ordering::Relaxed),
            limiter_timeouts: self.limiter_timeouts.load(Ordering::Relaxed),
            failure_rate: self.failure_rate_at(Utc::now(), min_samples),
        }
    }
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self::new(Duration::minutes(5))
    }
}

/// A point-in-time snapshot of queue metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Jobs admitted.
    pub enqueued: u64,
    /// Duplicate submissions.
    pub duplicates: u64,
    /// Throttled submissions or runs.
    pub throttled: u64,
    /// Successful handler runs.
    pub completed: u64,
    /// Failed handler runs.
    pub failed: u64,
    /// Jobs resubmitted by recovery.
    pub recovered: u64,
    /// Limiter tokens granted.
    pub tokens_acquired: u64,
    /// Limiter timeouts.
    pub limiter_timeouts: u64,
    /// Trailing failure rate, when enough samples exist.
    pub failure_rate: Option<f64>,
}
