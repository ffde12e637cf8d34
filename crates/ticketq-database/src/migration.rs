//! Database migration runner.

use sqlx::PgPool;
use tracing::info;

use ticketq_core::error::{AppError, ErrorKind};

/// Apply the `jobs` and `idempotency_keys` schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), AppError> {
    info!("Running job queue migrations");

    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| {
            AppError::with_source(
                ErrorKind::Database,
                format!("Failed to run migrations: {e}"),
                e,
            )
        })?;

    info!("Job queue migrations applied");
    Ok(())
}
