//! Shared test helpers for integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use ticketq_cache::CacheManager;
use ticketq_cache::memory::MemoryCacheProvider;
use ticketq_core::config::{AppConfig, ServiceLimit};
use ticketq_database::memory::{MemoryIdempotencyStore, MemoryJobStore};
use ticketq_entity::job::Job;
use ticketq_queue::{
    Broker, Delivery, IdempotencyService, JobExecutionError, JobExecutor, JobHandler, JobQueue,
    KeyDerivationRegistry, MemoryBroker, QueueMetrics, RateLimiter, RecoveryManager,
    TieredPersistence,
};

/// One process worth of queue components over in-memory stores.
///
/// The durable stores are shared between an app and the app returned by
/// [`TestApp::restart`]; cache, broker, limiter and metrics are not.
pub struct TestApp {
    /// Application config
    pub config: AppConfig,
    /// Tier 1 job rows
    pub store: MemoryJobStore,
    /// Durable idempotency records
    pub records: MemoryIdempotencyStore,
    /// In-process broker
    pub broker: Arc<MemoryBroker>,
    /// Shared metrics
    pub metrics: Arc<QueueMetrics>,
    /// Rate limiter
    pub limiter: Arc<RateLimiter>,
    /// Idempotency service
    pub idempotency: Arc<IdempotencyService>,
    /// Tiered persistence
    pub persistence: Arc<TieredPersistence>,
    /// Producer-facing queue
    pub queue: Arc<JobQueue>,
}

impl TestApp {
    /// Create an app with the default config and a `stripe` limit.
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config
            .limiter
            .services
            .insert("stripe".to_string(), ServiceLimit::new(100.0, 10, 100));
        config.limiter.acquire_timeout_ms = 200;
        Self::with_config(config)
    }

    /// Create an app from `config` over fresh stores.
    pub fn with_config(config: AppConfig) -> Self {
        Self::build(config, MemoryJobStore::new(), MemoryIdempotencyStore::new())
    }

    /// Simulate a process restart: same durable stores, everything else new.
    pub fn restart(&self) -> Self {
        Self::build(self.config.clone(), self.store.clone(), self.records.clone())
    }

    fn build(config: AppConfig, store: MemoryJobStore, records: MemoryIdempotencyStore) -> Self {
        let cache =
            CacheManager::from_provider(Arc::new(MemoryCacheProvider::new(&config.cache.memory)));
        let metrics = Arc::new(QueueMetrics::default());
        let broker = Arc::new(MemoryBroker::from_config(&config.queue));
        let limiter = Arc::new(RateLimiter::new(&config.limiter, Arc::clone(&metrics)));
        let idempotency = Arc::new(IdempotencyService::new(
            cache.clone(),
            Arc::new(records.clone()),
            KeyDerivationRegistry::with_defaults(),
            &config.idempotency,
        ));
        let persistence = Arc::new(TieredPersistence::new(
            Arc::new(store.clone()),
            cache,
            &config.queue,
        ));
        let queue = Arc::new(JobQueue::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::clone(&persistence),
            Arc::clone(&idempotency),
            Arc::clone(&limiter),
            Arc::clone(&metrics),
            config.queue.clone(),
            Duration::from_millis(config.limiter.acquire_timeout_ms),
        ));

        Self {
            config,
            store,
            records,
            broker,
            metrics,
            limiter,
            idempotency,
            persistence,
            queue,
        }
    }

    /// Executor with the given handlers registered.
    pub fn executor(&self, handlers: Vec<Arc<dyn JobHandler>>) -> Arc<JobExecutor> {
        let mut executor = JobExecutor::new(
            Arc::clone(&self.persistence),
            Arc::clone(&self.idempotency),
            Arc::clone(&self.limiter),
            Arc::clone(&self.metrics),
            Duration::from_millis(self.config.limiter.acquire_timeout_ms),
        );
        for handler in handlers {
            executor.register(handler);
        }
        Arc::new(executor)
    }

    /// Recovery manager over this app's store and broker.
    pub fn recovery(&self) -> RecoveryManager {
        RecoveryManager::new(
            Arc::new(self.store.clone()),
            Arc::clone(&self.broker) as Arc<dyn Broker>,
            Arc::clone(&self.metrics),
            &self.config.recovery,
        )
    }

    /// Next delivery from any queue.
    pub async fn next_delivery(&self) -> Option<Delivery> {
        self.broker
            .next(&self.broker.queue_names())
            .await
            .expect("broker next failed")
    }

    /// Deliver and settle jobs until the broker has nothing ready.
    pub async fn drain(&self, executor: &JobExecutor) -> usize {
        let mut settled = 0;
        while let Some(delivery) = self.next_delivery().await {
            ticketq_queue::runner::settle(
                self.broker.as_ref(),
                executor,
                delivery,
                Duration::from_millis(10),
            )
            .await;
            settled += 1;
        }
        settled
    }
}

/// Handler that counts its runs and echoes part of the payload.
#[derive(Debug)]
pub struct CountingHandler {
    job_type: &'static str,
    service_key: Option<&'static str>,
    /// Runs so far
    pub calls: AtomicUsize,
    delay: Duration,
    failure: Option<Failure>,
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Transient,
    Permanent,
}

impl CountingHandler {
    /// Succeeding handler for `job_type`.
    pub fn new(job_type: &'static str) -> Self {
        Self {
            job_type,
            service_key: None,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            failure: None,
        }
    }

    /// Gate runs on a limiter key.
    pub fn limited_by(mut self, service_key: &'static str) -> Self {
        self.service_key = Some(service_key);
        self
    }

    /// Sleep this long inside each run.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every run transiently.
    pub fn failing(mut self) -> Self {
        self.failure = Some(Failure::Transient);
        self
    }

    /// Reject every run permanently, as a declined card would.
    pub fn declining(mut self) -> Self {
        self.failure = Some(Failure::Permanent);
        self
    }

    /// Runs so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for CountingHandler {
    fn job_type(&self) -> &str {
        self.job_type
    }

    fn service_key(&self) -> Option<&str> {
        self.service_key
    }

    async fn execute(&self, job: &Job) -> Result<Option<Value>, JobExecutionError> {
        let run = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.failure {
            Some(Failure::Transient) => {
                return Err(JobExecutionError::Transient(format!("run {run} failed")));
            }
            Some(Failure::Permanent) => {
                return Err(JobExecutionError::Permanent(format!("run {run} declined")));
            }
            None => {}
        }
        Ok(Some(json!({"jobId": job.id, "run": run})))
    }
}
