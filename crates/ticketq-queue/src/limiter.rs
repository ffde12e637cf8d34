//! Token-bucket limiter gating calls into downstream services.
//!
//! Each bucket enforces two limits at once: a token bucket for the rate of
//! new calls and a semaphore for the number of calls in flight. Waiters for
//! a concurrency slot queue on the semaphore and are woken by `release`;
//! waiters for a token sleep until the next token is due, in steps no longer
//! than the configured poll interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use ticketq_core::config::{LimiterConfig, ServiceLimit};

use crate::monitor::metrics::QueueMetrics;

/// Shortest sleep between token checks, so a rounding remainder never spins.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Tolerance for floating-point refill arithmetic.
const TOKEN_EPSILON: f64 = 1e-9;

/// Returned when `acquire` could not get a slot and a token before its deadline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Rate limiter timed out after {waited:?} waiting for '{service_key}'")]
pub struct LimiterTimeout {
    /// Service key that was requested.
    pub service_key: String,
    /// How long the caller was willing to wait.
    pub waited: Duration,
}

#[derive(Debug)]
struct TokenState {
    tokens: f64,
    last_refill: Instant,
}

/// State of one bucket, shared by every service key routed to it.
#[derive(Debug)]
struct TokenBucket {
    name: String,
    limit: ServiceLimit,
    slots: Semaphore,
    in_flight: AtomicUsize,
    state: Mutex<TokenState>,
}

impl TokenBucket {
    fn new(name: impl Into<String>, limit: ServiceLimit) -> Self {
        Self {
            name: name.into(),
            limit,
            slots: Semaphore::new(limit.max_concurrent),
            in_flight: AtomicUsize::new(0),
            state: Mutex::new(TokenState {
                tokens: f64::from(limit.burst_size),
                last_refill: Instant::now(),
            }),
        }
    }

    fn capacity(&self) -> f64 {
        f64::from(self.limit.burst_size)
    }

    /// Refill from elapsed time, then take one token or report how long until one is due.
    async fn try_take(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.limit.max_per_second).min(self.capacity());
        state.last_refill = now;

        if state.tokens + TOKEN_EPSILON >= 1.0 {
            state.tokens = (state.tokens - 1.0).max(0.0);
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(missing / self.limit.max_per_second))
        }
    }
}

/// Per-service rate and concurrency gate.
///
/// Service keys named in a configured group share that group's bucket.
/// Keys with no configuration get a bucket with the default limits on first use.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, Arc<TokenBucket>>,
    routes: HashMap<String, String>,
    default_limit: ServiceLimit,
    poll_interval: Duration,
    metrics: Arc<QueueMetrics>,
}

impl RateLimiter {
    /// Build the limiter and its configured buckets.
    pub fn new(config: &LimiterConfig, metrics: Arc<QueueMetrics>) -> Self {
        let buckets = DashMap::new();
        let mut routes = HashMap::new();

        for (key, limit) in &config.services {
            buckets.insert(key.clone(), Arc::new(TokenBucket::new(key.clone(), *limit)));
        }
        for group in &config.groups {
            buckets.insert(
                group.name.clone(),
                Arc::new(TokenBucket::new(group.name.clone(), group.limit)),
            );
            for member in &group.members {
                routes.insert(member.clone(), group.name.clone());
            }
        }

        Self {
            buckets,
            routes,
            default_limit: config.default,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            metrics,
        }
    }

    fn bucket(&self, service_key: &str) -> Arc<TokenBucket> {
        let name = self
            .routes
            .get(service_key)
            .map(String::as_str)
            .unwrap_or(service_key);

        if let Some(bucket) = self.buckets.get(name) {
            return Arc::clone(bucket.value());
        }
        let bucket = self
            .buckets
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(name, self.default_limit)));
        Arc::clone(bucket.value())
    }

    /// Wait for a concurrency slot and a token for `service_key`.
    ///
    /// On success the caller holds one in-flight slot until it calls
    /// [`release`](Self::release). Tokens are consumed, never returned.
    pub async fn acquire(&self, service_key: &str, timeout: Duration) -> Result<(), LimiterTimeout> {
        let bucket = self.bucket(service_key);
        let deadline = Instant::now() + timeout;
        let timed_out = || {
            self.metrics.record_limiter_timeout();
            debug!(service_key, bucket = %bucket.name, "Limiter acquire timed out");
            LimiterTimeout {
                service_key: service_key.to_string(),
                waited: timeout,
            }
        };

        let permit = match time::timeout_at(deadline, bucket.slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            _ => return Err(timed_out()),
        };

        loop {
            match bucket.try_take().await {
                Ok(()) => break,
                Err(until_next) => {
                    let now = Instant::now();
                    if now >= deadline {
                        // Dropping the permit hands the slot to the next waiter.
                        drop(permit);
                        return Err(timed_out());
                    }
                    let step = until_next
                        .min(self.poll_interval)
                        .min(deadline - now)
                        .max(MIN_WAIT);
                    time::sleep(step).await;
                }
            }
        }

        permit.forget();
        bucket.in_flight.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_token_acquired();
        Ok(())
    }

    /// Give back the in-flight slot taken by a successful `acquire`.
    pub fn release(&self, service_key: &str) {
        let bucket = self.bucket(service_key);
        let released = bucket
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if released {
            bucket.slots.add_permits(1);
        } else {
            warn!(service_key, bucket = %bucket.name, "Release without a matching acquire");
        }
    }

    /// Calls currently in flight on the bucket serving `service_key`.
    pub fn in_flight(&self, service_key: &str) -> usize {
        self.bucket(service_key).in_flight.load(Ordering::SeqCst)
    }
}
