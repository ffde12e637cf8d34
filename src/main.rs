//! TicketToken job queue server
//!
//! Wires the reliability crates together: stores, cache, broker, limiter,
//! idempotency, recovery, monitoring, maintenance and the worker pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt};

use ticketq_cache::CacheManager;
use ticketq_core::config::AppConfig;
use ticketq_core::error::AppError;
use ticketq_core::traits::CacheProvider;
use ticketq_database::memory::{MemoryIdempotencyStore, MemoryJobStore};
use ticketq_database::{DatabasePool, IdempotencyRecordStore, JobStore};
use ticketq_queue::monitor::alerts::LogAlertSink;
use ticketq_queue::{
    Broker, IdempotencyService, JobExecutor, KeyDerivationRegistry, MaintenanceScheduler,
    MaintenanceTasks, MemoryBroker, Monitor, QueueMetrics, RateLimiter, RecoveryManager,
    TieredPersistence, WorkerRunner,
};

#[tokio::main]
async fn main() {
    let config = match load_configuration() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

/// Load configuration from file and environment
fn load_configuration() -> Result<AppConfig, AppError> {
    let env = std::env::var("TICKETQ_ENV").unwrap_or_else(|_| "development".to_string());
    AppConfig::load(&env)
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

/// Durable stores selected by `database.provider`
async fn open_stores(
    config: &AppConfig,
) -> Result<(Arc<dyn JobStore>, Arc<dyn IdempotencyRecordStore>, Option<DatabasePool>), AppError> {
    match config.database.provider.as_str() {
        "postgres" => {
            let pool = DatabasePool::connect(&config.database).await?;
            ticketq_database::migration::run_migrations(pool.pool()).await?;
            Ok((pool.job_store(), pool.idempotency_store(), Some(pool)))
        }
        "memory" => {
            tracing::warn!("Using in-memory stores; Tier 1 jobs will not survive a restart");
            Ok((
                Arc::new(MemoryJobStore::new()),
                Arc::new(MemoryIdempotencyStore::new()),
                None,
            ))
        }
        other => Err(AppError::configuration(format!(
            "Unknown database provider '{other}'"
        ))),
    }
}

/// Main server run function
async fn run(config: AppConfig) -> Result<(), AppError> {
    tracing::info!("Starting ticketq v{}", env!("CARGO_PKG_VERSION"));

    // ── Step 1: Stores and cache ─────────────────────────────────
    let (job_store, idempotency_store, db_pool) = open_stores(&config).await?;

    if let Some(pool) = &db_pool {
        if !pool.health_check().await? {
            return Err(AppError::service_unavailable("Database health check failed"));
        }
    }

    tracing::info!(provider = %config.cache.provider, "Initializing cache");
    let cache = CacheManager::new(&config.cache).await?;
    match cache.health_check().await {
        Ok(true) => {}
        Ok(false) | Err(_) => tracing::warn!("Fast cache is not healthy; Tier 2 jobs may be lost"),
    }

    // ── Step 2: Reliability layer ────────────────────────────────
    let metrics = Arc::new(QueueMetrics::new(chrono::Duration::seconds(
        config.monitoring.failure_window_seconds,
    )));
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::from_config(&config.queue));
    let limiter = Arc::new(RateLimiter::new(&config.limiter, Arc::clone(&metrics)));
    let idempotency = Arc::new(IdempotencyService::new(
        cache.clone(),
        Arc::clone(&idempotency_store),
        KeyDerivationRegistry::with_defaults(),
        &config.idempotency,
    ));
    let persistence = Arc::new(TieredPersistence::new(
        Arc::clone(&job_store),
        cache.clone(),
        &config.queue,
    ));
    let acquire_timeout = Duration::from_millis(config.limiter.acquire_timeout_ms);

    let executor = Arc::new(JobExecutor::new(
        Arc::clone(&persistence),
        Arc::clone(&idempotency),
        Arc::clone(&limiter),
        Arc::clone(&metrics),
        acquire_timeout,
    ));
    tracing::info!(queues = ?broker.queue_names(), "Job queue ready");

    // ── Step 3: Recovery, before any worker pulls ────────────────
    if config.recovery.enabled {
        let recovery = RecoveryManager::new(
            Arc::clone(&job_store),
            Arc::clone(&broker),
            Arc::clone(&metrics),
            &config.recovery,
        );
        let report = recovery.recover_pending_jobs().await?;
        tracing::info!(recovered = report.recovered, "Startup recovery complete");
    } else {
        tracing::info!("Startup recovery disabled");
    }

    // ── Step 4: Shutdown channel ─────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // ── Step 5: Monitor ──────────────────────────────────────────
    if config.monitoring.enabled {
        let monitor = Monitor::new(Arc::clone(&broker), Arc::clone(&metrics), &config.monitoring)
            .with_sink(Arc::new(LogAlertSink));
        let cancel = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { monitor.run(cancel).await }));
    }

    // ── Step 6: Maintenance scheduler ────────────────────────────
    let mut scheduler = if config.maintenance.enabled {
        let tasks = MaintenanceTasks::new(
            Arc::clone(&idempotency),
            Arc::clone(&job_store),
            &config.maintenance,
        );
        let scheduler = MaintenanceScheduler::new(tasks, config.maintenance.clone()).await?;
        scheduler.register_default_tasks().await?;
        scheduler.start().await?;
        Some(scheduler)
    } else {
        tracing::info!("Maintenance scheduler disabled");
        None
    };

    // ── Step 7: Worker ───────────────────────────────────────────
    if !config.worker.enabled {
        tracing::info!("Background worker disabled");
    } else if executor.registered_types().is_empty() {
        tracing::warn!("No job handlers registered; worker not started");
    } else {
        let worker_id = format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let runner = WorkerRunner::new(
            Arc::clone(&broker),
            Arc::clone(&executor),
            config.worker.clone(),
            worker_id,
        );
        let cancel = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { runner.run(cancel).await }));
    }

    tracing::info!(metrics = ?metrics.snapshot(config.monitoring.failure_min_samples), "ticketq running");

    // ── Step 8: Graceful shutdown ────────────────────────────────
    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown...");
    let _ = shutdown_tx.send(true);

    if let Some(scheduler) = scheduler.as_mut() {
        if let Err(e) = scheduler.shutdown().await {
            tracing::warn!(error = %e, "Scheduler shutdown failed");
        }
    }

    let grace = Duration::from_secs(config.worker.shutdown_grace_seconds + 5);
    for handle in handles {
        if tokio::time::timeout(grace, handle).await.is_err() {
            tracing::warn!("Background task did not stop within the grace period");
        }
    }

    if let Some(pool) = db_pool {
        pool.close().await;
    }

    tracing::info!("ticketq shut down complete");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
