use std::time::Duration;

use serde_json::Value;
use tracing::info;

use crate::errors::AppResult;
use crate::kv::SharedStore;

/// Shared "stop this generation" flags keyed by assistant message id.
///
/// Cancellation is cooperative: the relay loop polls [`is_cancelled`] between
/// upstream chunks and events. Absence of a flag means not cancelled.
///
/// [`is_cancelled`]: CancellationRegistry::is_cancelled
#[derive(Clone)]
pub struct CancellationRegistry {
    store: SharedStore,
    ttl: Duration,
}

impl CancellationRegistry {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Raises the flag. Repeating it only refreshes the TTL.
    pub async fn cancel(&self, message_id: &str) -> AppResult<()> {
        self.store.set(&flag_key(message_id), Value::Bool(true), self.ttl).await?;
        info!("Cancellation requested for message {message_id}");
        Ok(())
    }

    pub async fn is_cancelled(&self, message_id: &str) -> AppResult<bool> {
        Ok(matches!(self.store.get(&flag_key(message_id)).await?, Some(Value::Bool(true))))
    }
}

fn flag_key(message_id: &str) -> String {
    format!("chat_cancel:{message_id}")
}
