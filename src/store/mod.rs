//! PostgreSQL-backed persistence.
//!
//! The pool is sized from configuration and the schema is bootstrapped with
//! idempotent statements at startup. Store methods run under a per-query
//! deadline so a stalled database cannot pin request tasks.

pub mod api_keys;
pub mod users;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::future::Future;
use std::time::Duration;

use crate::config::Config;

/// Errors surfaced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The per-query deadline elapsed.
    #[error("database query timed out")]
    Timeout,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Connects a pool using the configured sizing.
pub async fn connect(config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.db_max_open)
        .min_connections(config.db_max_idle)
        .max_lifetime(config.db_conn_max_lifetime)
        .idle_timeout(config.db_conn_max_idle_time)
        .acquire_timeout(config.db_timeout)
        .connect(&config.database_url)
        .await
}

/// Applies the schema. Safe to run on every boot.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            id UUID PRIMARY KEY,
            address TEXT NOT NULL UNIQUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS api_keys (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            key_hash TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            scopes TEXT[] NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            last_used_at TIMESTAMPTZ,
            expires_at TIMESTAMPTZ
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS api_keys_user_id_idx ON api_keys (user_id)")
        .execute(pool)
        .await?;
    Ok(())
}

/// Runs a query future under the store deadline.
pub(crate) async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result.map_err(StoreError::Database),
        Err(_) => Err(StoreError::Timeout),
    }
}
