//! Broker seam and the in-process broker.
//!
//! The broker stores pending jobs and hands them to workers. Jobs are keyed
//! by their own id: submitting an id the broker already holds is a no-op,
//! which makes a recovered resubmission and a live copy of the same job
//! collapse into one delivery.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use ticketq_core::config::QueueConfig;
use ticketq_core::error::AppError;
use ticketq_core::result::AppResult;
use ticketq_entity::job::{Job, JobPriority};

/// A job handed to a worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The delivered job.
    pub job: Job,
    /// Deliveries still allowed after this one.
    pub attempts_left: i32,
}

/// Point-in-time statistics of one queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Queue name.
    pub queue: String,
    /// Jobs waiting for delivery, delayed retries included.
    pub depth: u64,
    /// Jobs delivered and not yet acknowledged.
    pub in_flight: u64,
    /// Age in seconds of the longest-waiting job.
    pub oldest_age_seconds: Option<f64>,
}

/// Message broker the queue core submits to and workers pull from.
#[async_trait]
pub trait Broker: Send + Sync + std::fmt::Debug + 'static {
    /// Whether the broker serves a queue with this name.
    fn knows_queue(&self, queue: &str) -> bool;

    /// Names of every queue the broker serves.
    fn queue_names(&self) -> Vec<String>;

    /// Submit a job under its own id with `attempts` deliveries allowed.
    ///
    /// Returns `false` if the broker already holds a job with that id.
    async fn submit(&self, job: &Job, attempts: i32) -> AppResult<bool>;

    /// Take the next deliverable job from `queues`, highest priority first.
    async fn next(&self, queues: &[String]) -> AppResult<Option<Delivery>>;

    /// Schedule another delivery after `delay`. Returns `false` when no attempts remain.
    async fn retry(&self, job_id: Uuid, delay: Duration) -> AppResult<bool>;

    /// Put a delivered job back after `delay` without spending an attempt.
    async fn requeue(&self, job_id: Uuid, delay: Duration) -> AppResult<()>;

    /// Forget a delivered job that reached a terminal state.
    async fn ack(&self, job_id: Uuid) -> AppResult<()>;

    /// Drop a job that has not been delivered yet.
    async fn remove(&self, job_id: Uuid) -> AppResult<bool>;

    /// Whether the broker still holds the job, waiting or in flight.
    async fn holds(&self, job_id: Uuid) -> AppResult<bool>;

    /// Statistics for one queue.
    async fn queue_stats(&self, queue: &str) -> AppResult<QueueStats>;
}

#[derive(Debug, Clone)]
struct Entry {
    job: Job,
    attempts_left: i32,
    seq: u64,
    enqueued_at: DateTime<Utc>,
}

impl Entry {
    fn rank(&self) -> (JobPriority, std::cmp::Reverse<u64>) {
        (self.job.priority, std::cmp::Reverse(self.seq))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BinaryHeap<Entry>,
    delayed: Vec<(Instant, Entry)>,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, entry) = self.delayed.swap_remove(i);
                self.ready.push(entry);
            } else {
                i += 1;
            }
        }
    }

    fn contains(&self, id: Uuid) -> bool {
        self.ready.iter().any(|e| e.job.id == id) || self.delayed.iter().any(|(_, e)| e.job.id == id)
    }

    fn depth(&self) -> u64 {
        (self.ready.len() + self.delayed.len()) as u64
    }

    fn oldest(&self) -> Option<DateTime<Utc>> {
        self.ready
            .iter()
            .chain(self.delayed.iter().map(|(_, e)| e))
            .map(|e| e.enqueued_at)
            .min()
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    in_flight: HashMap<Uuid, Entry>,
    seq: u64,
}

/// In-process broker with named priority queues.
///
/// Everything lives in memory: a process restart loses every queued job,
/// which is exactly the Tier 3 guarantee.
#[derive(Debug)]
pub struct MemoryBroker {
    names: Vec<String>,
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    /// Create a broker serving the named queues.
    pub fn new<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = queues.into_iter().map(Into::into).collect();
        let queues = names
            .iter()
            .map(|n| (n.clone(), QueueState::default()))
            .collect();
        Self {
            names,
            state: Mutex::new(BrokerState {
                queues,
                ..BrokerState::default()
            }),
        }
    }

    /// Create a broker serving every configured queue.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.queues.iter().map(|q| q.name.clone()))
    }

    /// Total number of jobs held, waiting or in flight.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.in_flight.len()
            + state
                .queues
                .values()
                .map(|q| q.depth() as usize)
                .sum::<usize>()
    }

    /// Whether the broker holds no jobs.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn reschedule(state: &mut BrokerState, entry: Entry, delay: Duration) -> AppResult<()> {
        let queue = state
            .queues
            .get_mut(&entry.job.queue_name)
            .ok_or_else(|| AppError::broker(format!("Unknown queue '{}'", entry.job.queue_name)))?;
        if delay.is_zero() {
            queue.ready.push(entry);
        } else {
            queue.delayed.push((Instant::now() + delay, entry));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn knows_queue(&self, queue: &str) -> bool {
        self.names.iter().any(|n| n == queue)
    }

    fn queue_names(&self) -> Vec<String> {
        self.names.clone()
    }

    async fn submit(&self, job: &Job, attempts: i32) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        if state.in_flight.contains_key(&job.id) {
            return Ok(false);
        }
        let seq = state.seq;
        let queue = state
            .queues
            .get_mut(&job.queue_name)
            .ok_or_else(|| AppError::broker(format!("Unknown queue '{}'", job.queue_name)))?;
        if queue.contains(job.id) {
            return Ok(false);
        }

        queue.ready.push(Entry {
            job: job.clone(),
            attempts_left: attempts,
            seq,
            enqueued_at: Utc::now(),
        });
        state.seq += 1;
        debug!(job_id = %job.id, queue = %job.queue_name, attempts, "Job submitted to broker");
        Ok(true)
    }

    async fn next(&self, queues: &[String]) -> AppResult<Option<Delivery>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let mut picked: Option<(String, (JobPriority, std::cmp::Reverse<u64>))> = None;
        for name in queues {
            let Some(queue) = state.queues.get_mut(name) else {
                continue;
            };
            queue.promote_due(now);
            if let Some(top) = queue.ready.peek() {
                let rank = top.rank();
                if picked.as_ref().is_none_or(|(_, best)| rank > *best) {
                    picked = Some((name.clone(), rank));
                }
            }
        }

        let Some((name, _)) = picked else {
            return Ok(None);
        };
        let Some(mut entry) = state.queues.get_mut(&name).and_then(|q| q.ready.pop()) else {
            return Ok(None);
        };

        entry.attempts_left -= 1;
        let delivery = Delivery {
            job: entry.job.clone(),
            attempts_left: entry.attempts_left,
        };
        state.in_flight.insert(entry.job.id, entry);
        Ok(Some(delivery))
    }

    async fn retry(&self, job_id: Uuid, delay: Duration) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.in_flight.remove(&job_id) else {
            return Ok(false);
        };
        if entry.attempts_left <= 0 {
            return Ok(false);
        }
        Self::reschedule(&mut state, entry, delay)?;
        Ok(true)
    }

    async fn requeue(&self, job_id: Uuid, delay: Duration) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let Some(mut entry) = state.in_flight.remove(&job_id) else {
            return Err(AppError::not_found(format!("Job {job_id} is not in flight")));
        };
        entry.attempts_left += 1;
        Self::reschedule(&mut state, entry, delay)
    }

    async fn ack(&self, job_id: Uuid) -> AppResult<()> {
        self.state.lock().await.in_flight.remove(&job_id);
        Ok(())
    }

    async fn remove(&self, job_id: Uuid) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        for queue in state.queues.values_mut() {
            let before = queue.depth();
            queue.ready.retain(|e| e.job.id != job_id);
            queue.delayed.retain(|(_, e)| e.job.id != job_id);
            if queue.depth() < before {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn holds(&self, job_id: Uuid) -> AppResult<bool> {
        let state = self.state.lock().await;
        Ok(state.in_flight.contains_key(&job_id)
            || state.queues.values().any(|q| q.contains(job_id)))
    }

    async fn queue_stats(&self, queue: &str) -> AppResult<QueueStats> {
        let state = self.state.lock().await;
        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| AppError::broker(format!("Unknown queue '{queue}'")))?;
        let in_flight = state
            .in_flight
            .values()
            .filter(|e| e.job.queue_name == queue)
            .count() as u64;
        let oldest_age_seconds = q
            .oldest()
            .map(|at| (Utc::now() - at).num_milliseconds().max(0) as f64 / 1000.0);

        Ok(QueueStats {
            queue: queue.to_string(),
            depth: q.depth(),
            in_flight,
            oldest_age_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ticketq_entity::job::DurabilityTier;

    fn job(queue: &str, priority: JobPriority) -> Job {
        Job::new(
            queue,
            "analytics-event",
            serde_json::json!({}),
            priority,
            DurabilityTier::Ephemeral,
            3,
        )
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let broker = MemoryBroker::new(["money", "background"]);
        let low = job("background", JobPriority::Low);
        let first = job("money", JobPriority::High);
        let second = job("money", JobPriority::High);
        for j in [&low, &first, &second] {
            broker.submit(j, 3).await.unwrap();
        }

        let queues = names(&["money", "background"]);
        let order: Vec<Uuid> = [
            broker.next(&queues).await.unwrap().unwrap(),
            broker.next(&queues).await.unwrap().unwrap(),
            broker.next(&queues).await.unwrap().unwrap(),
        ]
        .iter()
        .map(|d| d.job.id)
        .collect();
        assert_eq!(order, vec![first.id, second.id, low.id]);
    }

    #[tokio::test]
    async fn test_same_id_is_held_once() {
        let broker = MemoryBroker::new(["money"]);
        let j = job("money", JobPriority::Normal);
        assert!(broker.submit(&j, 3).await.unwrap());
        assert!(!broker.submit(&j, 3).await.unwrap());

        broker.next(&names(&["money"])).await.unwrap().unwrap();
        assert!(!broker.submit(&j, 3).await.unwrap());
        assert_eq!(broker.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_queue_rejected() {
        let broker = MemoryBroker::new(["money"]);
        let err = broker
            .submit(&job("nowhere", JobPriority::Normal), 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ticketq_core::error::ErrorKind::Broker);
        assert!(!broker.knows_queue("nowhere"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_spends_attempts_and_waits() {
        let broker = MemoryBroker::new(["money"]);
        let queues = names(&["money"]);
        let j = job("money", JobPriority::Normal);
        broker.submit(&j, 2).await.unwrap();

        let d = broker.next(&queues).await.unwrap().unwrap();
        assert_eq!(d.attempts_left, 1);
        assert!(broker.retry(j.id, Duration::from_secs(5)).await.unwrap());
        assert!(broker.next(&queues).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        let d = broker.next(&queues).await.unwrap().unwrap();
        assert_eq!(d.attempts_left, 0);
        assert!(!broker.retry(j.id, Duration::ZERO).await.unwrap());
        assert!(broker.is_empty().await);
    }

    #[tokio::test]
    async fn test_requeue_keeps_attempts() {
        let broker = MemoryBroker::new(["money"]);
        let queues = names(&["money"]);
        let j = job("money", JobPriority::Normal);
        broker.submit(&j, 1).await.unwrap();

        broker.next(&queues).await.unwrap().unwrap();
        broker.requeue(j.id, Duration::ZERO).await.unwrap();
        let d = broker.next(&queues).await.unwrap().unwrap();
        assert_eq!(d.attempts_left, 0);
    }

    #[tokio::test]
    async fn test_stats_and_remove() {
        let broker = MemoryBroker::new(["communication"]);
        let a = job("communication", JobPriority::Normal);
        let b = job("communication", JobPriority::Normal);
        broker.submit(&a, 1).await.unwrap();
        broker.submit(&b, 1).await.unwrap();
        broker.next(&names(&["communication"])).await.unwrap();

        let stats = broker.queue_stats("communication").await.unwrap();
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.in_flight, 1);
        assert!(stats.oldest_age_seconds.is_some());

        assert!(broker.remove(b.id).await.unwrap());
        let stats = broker.queue_stats("communication").await.unwrap();
        assert_eq!(stats.depth, 0);
        assert_eq!(stats.oldest_age_seconds, None);
    }

    #[tokio::test]
    async fn test_holds_waiting_and_in_flight_until_ack() {
        let broker = MemoryBroker::new(["money"]);
        let queues = names(&["money"]);
        let j = job("money", JobPriority::High);
        assert!(!broker.holds(j.id).await.unwrap());

        broker.submit(&j, 2).await.unwrap();
        assert!(broker.holds(j.id).await.unwrap());
        broker.next(&queues).await.unwrap().unwrap();
        assert!(broker.holds(j.id).await.unwrap());
        broker.retry(j.id, Duration::from_secs(60)).await.unwrap();
        assert!(broker.holds(j.id).await.unwrap());

        broker.remove(j.id).await.unwrap();
        assert!(!broker.holds(j.id).await.unwrap());
    }
}
