//! PostgreSQL connection pool management.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use ticketq_core::config::DatabaseConfig;
use ticketq_core::error::{AppError, ErrorKind};

use crate::repositories::{IdempotencyRepository, JobRepository};
use crate::store::{IdempotencyRecordStore, JobStore};

/// Wrapper around the sqlx PostgreSQL pool backing the Tier 1 store.
#[derive(Debug, Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Create a new database pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        info!(
            url = %mask_password(&config.url),
            max_connections = config.max_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await
            .map_err(|e| {
                AppError::with_source(
                    ErrorKind::Database,
                    format!("Failed to connect to database: {e}"),
                    e,
                )
            })?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Return a reference to the underlying sqlx pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Job store backed by this pool.
    pub fn job_store(&self) -> Arc<dyn JobStore> {
        Arc::new(JobRepository::new(self.pool.clone()))
    }

    /// Idempotency record store backed by this pool.
    pub fn idempotency_store(&self) -> Arc<dyn IdempotencyRecordStore> {
        Arc::new(IdempotencyRepository::new(self.pool.clone()))
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<bool, AppError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|v| v == 1)
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Health check failed", e))
    }

    /// Close all connections in the pool.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}

/// Mask the password portion of a database URL for safe logging.
fn mask_password(url: &str) -> String {
    let Some(at_pos) = url.find('@') else {
        return url.to_string();
    };
    let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
    match url[..at_pos].rfind(':') {
        Some(colon_pos) if colon_pos > scheme_end => {
            format!("{}:****@{}", &url[..colon_pos], &url[at_pos + 1..])
        }
        _ => url.to_string(),
    }
}
