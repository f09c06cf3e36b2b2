use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::KeyValueStore;
use crate::errors::AppResult;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

type Map = RwLock<HashMap<String, Entry>>;

/// Process-local store. Expired entries are dropped lazily on read and, when
/// built with [`InMemoryStore::with_cleanup`], by a periodic sweep.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<Map>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a sweeper on the current tokio runtime. The task ends once the
    /// last clone of the store is dropped.
    pub fn with_cleanup(interval: Duration) -> Self {
        let store = Self::new();
        let weak = Arc::downgrade(&store.entries);
        tokio::spawn(sweep(weak, interval));
        store
    }
}

async fn sweep(entries: Weak<Map>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let Some(entries) = entries.upgrade() else {
            debug!("KV store dropped, stopping cleanup task");
            break;
        };
        let now = Instant::now();
        let mut guard = entries.write().await;
        let before = guard.len();
        guard.retain(|_, e| !e.is_expired(now));
        let removed = before - guard.len();
        drop(guard);
        if removed > 0 {
            debug!("Cleaned up {removed} expired KV entries");
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> AppResult<Option<Value>> {
        let now = Instant::now();
        {
            let guard = self.entries.read().await;
            match guard.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }
        // Expired: take the write lock and re-check before removing.
        let mut guard = self.entries.write().await;
        if guard.get(key).is_some_and(|e| e.is_expired(now)) {
            guard.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> AppResult<()> {
        let entry = Entry { value, expires_at: Instant::now() + ttl };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }
}
