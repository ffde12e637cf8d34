//! Reliability layer of the TicketToken job queue.
//!
//! This crate provides:
//! - A token-bucket limiter for calls into downstream services
//! - An idempotency store that collapses duplicate submissions
//! - Tiered persistence of job state by durability tier
//! - Startup recovery of unfinished critical jobs
//! - Metric collection and threshold alerting
//! - A worker runner and cron scheduler driving the above against a broker

pub mod broker;
pub mod executor;
pub mod idempotency;
pub mod limiter;
pub mod monitor;
pub mod persistence;
pub mod queue;
pub mod recovery;
pub mod runner;
pub mod scheduler;

pub use broker::{Broker, Delivery, MemoryBroker, QueueStats};
pub use executor::{ExecutionOutcome, JobExecutionError, JobExecutor, JobHandler};
pub use idempotency::{Admission, IdempotencyService, KeyDerivationRegistry};
pub use limiter::{LimiterTimeout, RateLimiter};
pub use monitor::{AlertEvent, AlertSink, Monitor, QueueMetrics};
pub use persistence::TieredPersistence;
pub use queue::{EnqueueOutcome, EnqueueRequest, JobQueue};
pub use recovery::{RecoveryManager, RecoveryReport};
pub use runner::WorkerRunner;
pub use scheduler::{MaintenanceScheduler, MaintenanceTasks};
