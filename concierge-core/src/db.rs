use crate::config::DatabaseConfig;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.timeout())
        .connect(&config.url)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

/// Table names are interpolated into SQL, so only plain identifiers are allowed.
pub fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63
}

pub async fn table_exists(pool: &PgPool, table: &str) -> Result<bool, sqlx::Error> {
    let row: (Option<String>,) = sqlx::query_as("SELECT to_regclass($1)::text")
        .bind(table)
        .fetch_one(pool)
        .await?;
    Ok(row.0.is_some())
}

/// Create the context table if it is missing, then wait until it is visible.
pub async fn ensure_context_table(
    pool: &PgPool,
    table: &str,
    poll_ms: u64,
    attempts: usize,
) -> Result<(), sqlx::Error> {
    if !is_valid_table_name(table) {
        return Err(sqlx::Error::Configuration(
            format!("invalid table name '{table}'").into(),
        ));
    }

    if table_exists(pool, table).await? {
        tracing::debug!(table, "Context table present");
        return Ok(());
    }

    tracing::info!(table, "Context table missing, creating");
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            resource_name TEXT PRIMARY KEY,
            data JSONB NOT NULL DEFAULT '{{}}'::jsonb,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"
    );
    sqlx::query(&ddl).execute(pool).await?;

    let strategy = FixedInterval::new(Duration::from_millis(poll_ms)).take(attempts);
    Retry::spawn(strategy, || async {
        if table_exists(pool, table).await? {
            Ok(())
        } else {
            Err(sqlx::Error::RowNotFound)
        }
    })
    .await?;

    tracing::info!(table, "Context table ready");
    Ok(())
}
