//! Keyed, expiring shared state.
//!
//! Rate-limit windows and cancellation flags must be visible to every
//! process serving the same user, so they live behind [`KeyValueStore`]
//! instead of in handler-local memory. [`memory::InMemoryStore`] is enough
//! for a single instance; [`postgres::PgKeyValueStore`] shares state through
//! the application database.

pub mod memory;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::AppResult;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns the live value for `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> AppResult<Option<Value>>;

    /// Stores `value` under `key`, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> AppResult<()>;
}

pub type SharedStore = Arc<dyn KeyValueStore>;
