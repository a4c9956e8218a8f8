//! Durable tier of the context store.
//!
//! Records are keyed by customer identifier (`resource_name`) and always
//! written as full-record overwrites.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::config::DatabaseConfig;
use crate::db;
use crate::error::ConciergeError;

#[derive(Error, Debug)]
pub enum DurableError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("durable store timed out after {0:?}")]
    Timeout(Duration),

    #[error("durable store unavailable: {0}")]
    Unavailable(String),
}

impl From<DurableError> for ConciergeError {
    fn from(e: DurableError) -> Self {
        ConciergeError::UpstreamUnavailable(e.to_string())
    }
}

/// Persisted record: `{resourceName, data, updatedAt}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRecord {
    pub resource_name: String,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<ContextRecord>, DurableError>;

    async fn save(&self, key: &str, data: &Value) -> Result<(), DurableError>;

    async fn delete(&self, key: &str) -> Result<bool, DurableError>;

    async fn list(&self) -> Result<Vec<(String, DateTime<Utc>)>, DurableError>;

    async fn ping(&self) -> Result<(), DurableError>;

    /// Backend name for logging and `/health`.
    fn name(&self) -> &str;
}

// ============================================================================
// PostgreSQL
// ============================================================================

pub struct PgDurableStore {
    pool: PgPool,
    table: String,
    timeout: Duration,
}

impl PgDurableStore {
    /// Connect, provision the table, and wait until it is usable.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DurableError> {
        let pool = db::create_pool(config).await?;
        Self::from_pool(pool, config).await
    }

    pub async fn from_pool(pool: PgPool, config: &DatabaseConfig) -> Result<Self, DurableError> {
        db::ensure_context_table(
            &pool,
            &config.table,
            config.provision_poll_ms,
            config.provision_attempts,
        )
        .await?;
        Ok(Self {
            pool,
            table: config.table.clone(),
            timeout: config.timeout(),
        })
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, DurableError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(DurableError::from),
            Err(_) => Err(DurableError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl DurableStore for PgDurableStore {
    async fn load(&self, key: &str) -> Result<Option<ContextRecord>, DurableError> {
        let sql = format!(
            "SELECT resource_name, data, updated_at FROM {} WHERE resource_name = $1",
            self.table
        );
        let row: Option<(String, Json<Value>, DateTime<Utc>)> = self
            .bounded(sqlx::query_as(&sql).bind(key).fetch_optional(&self.pool))
            .await?;
        Ok(row.map(|(resource_name, Json(data), updated_at)| ContextRecord {
            resource_name,
            data,
            updated_at,
        }))
    }

    async fn save(&self, key: &str, data: &Value) -> Result<(), DurableError> {
        let sql = format!(
            "INSERT INTO {} (resource_name, data, updated_at) VALUES ($1, $2, NOW())
             ON CONFLICT (resource_name) DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()",
            self.table
        );
        self.bounded(sqlx::query(&sql).bind(key).bind(Json(data)).execute(&self.pool))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, DurableError> {
        let sql = format!("DELETE FROM {} WHERE resource_name = $1", self.table);
        let result = self
            .bounded(sqlx::query(&sql).bind(key).execute(&self.pool))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<(String, DateTime<Utc>)>, DurableError> {
        let sql = format!(
            "SELECT resource_name, updated_at FROM {} ORDER BY updated_at DESC",
            self.table
        );
        self.bounded(sqlx::query_as(&sql).fetch_all(&self.pool)).await
    }

    async fn ping(&self) -> Result<(), DurableError> {
        self.bounded(db::health_check(&self.pool)).await.map(|_| ())
    }

    fn name(&self) -> &str {
        "postgres"
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local durable tier, used when no database is configured and in tests.
#[derive(Default)]
pub struct InMemoryDurableStore {
    records: Mutex<HashMap<String, ContextRecord>>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> DurableError {
        DurableError::Unavailable("in-memory store lock poisoned".into())
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn load(&self, key: &str) -> Result<Option<ContextRecord>, DurableError> {
        let records = self.records.lock().map_err(|_| Self::poisoned())?;
        Ok(records.get(key).cloned())
    }

    async fn save(&self, key: &str, data: &Value) -> Result<(), DurableError> {
        let mut records = self.records.lock().map_err(|_| Self::poisoned())?;
        records.insert(
            key.to_string(),
            ContextRecord {
                resource_name: key.to_string(),
                data: data.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, DurableError> {
        let mut records = self.records.lock().map_err(|_| Self::poisoned())?;
        Ok(records.remove(key).is_some())
    }

    async fn list(&self) -> Result<Vec<(String, DateTime<Utc>)>, DurableError> {
        let records = self.records.lock().map_err(|_| Self::poisoned())?;
        let mut out: Vec<_> = records
            .values()
            .map(|r| (r.resource_name.clone(), r.updated_at))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(out)
    }

    async fn ping(&self) -> Result<(), DurableError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
