use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, error};

use super::KeyValueStore;
use crate::errors::{AppError, AppResult};

/// Store backed by the `kv_entries` table, readable from every instance.
#[derive(Clone)]
pub struct PgKeyValueStore {
    pool: PgPool,
}

impl PgKeyValueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Deletes rows whose TTL has elapsed. Reads already ignore them.
    pub async fn purge_expired(&self) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at <= $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to purge expired KV entries: {e}");
                AppError::db_query("Failed to purge expired KV entries", e)
            })?;
        let removed = result.rows_affected();
        if removed > 0 {
            debug!("Purged {removed} expired KV entries");
        }
        Ok(removed)
    }
}

#[async_trait]
impl KeyValueStore for PgKeyValueStore {
    async fn get(&self, key: &str) -> AppResult<Option<Value>> {
        sqlx::query_scalar::<_, Value>(
            "SELECT value FROM kv_entries WHERE key = $1 AND expires_at > $2",
        )
        .bind(key)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to read KV entry {key}: {e}");
            AppError::db_query(format!("Failed to read KV entry {key}"), e)
        })
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> AppResult<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| AppError::Unexpected(format!("TTL out of range: {e}")))?;
        sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(&value)
        .bind(Utc::now() + ttl)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to write KV entry {key}: {e}");
            AppError::db_query(format!("Failed to write KV entry {key}"), e)
        })?;
        Ok(())
    }
}
