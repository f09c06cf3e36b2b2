use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::errors::{AppError, AppResult};
use crate::kv::SharedStore;

/// Sliding-window admission control for prompt submissions, keyed by user.
///
/// The window is a list of unix timestamps (seconds) kept in the shared
/// store. Concurrent writers race last-writer-wins, which can only make the
/// limiter stricter than configured.
#[derive(Clone)]
pub struct PromptRateLimiter {
    store: SharedStore,
    max_requests: usize,
    interval: Duration,
}

impl PromptRateLimiter {
    pub fn new(store: SharedStore, config: &RateLimitConfig) -> Self {
        Self { store, max_requests: config.max_requests, interval: config.interval }
    }

    /// Admits one prompt for `user_id` or fails with [`AppError::RateLimitExceeded`].
    pub async fn assert_within_limit(&self, user_id: &str) -> AppResult<()> {
        self.assert_within_limit_at(user_id, Utc::now().timestamp()).await
    }

    pub(crate) async fn assert_within_limit_at(&self, user_id: &str, now: i64) -> AppResult<()> {
        let key = window_key(user_id);
        let interval = self.interval.as_secs() as i64;
        let window_start = now - interval;

        let mut recent: Vec<i64> = match self.store.get(&key).await? {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_i64).collect(),
            Some(other) => {
                warn!("Discarding malformed rate-limit window for user {user_id}: {other}");
                Vec::new()
            }
            None => Vec::new(),
        };
        recent.retain(|ts| *ts >= window_start);
        recent.sort_unstable();

        let rejected = recent.len() >= self.max_requests;
        if !rejected {
            recent.push(now);
        }
        self.store.set(&key, Value::from(recent.clone()), self.interval).await?;

        if rejected {
            let retry_after = recent.first().map_or(interval, |oldest| oldest + interval - now);
            let retry_after_seconds = retry_after.max(1) as u64;
            debug!("Rate limit hit for user {user_id}, retry in {retry_after_seconds}s");
            return Err(AppError::RateLimitExceeded { retry_after_seconds });
        }
        Ok(())
    }
}

fn window_key(user_id: &str) -> String {
    format!("prompt_rate_limit:{user_id}")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kv::memory::InMemoryStore;
    use crate::kv::KeyValueStore;

    fn limiter(store: &InMemoryStore, max_requests: usize, interval_secs: u64) -> PromptRateLimiter {
        PromptRateLimiter::new(
            Arc::new(store.clone()),
            &RateLimitConfig { max_requests, interval: Duration::from_secs(interval_secs) },
        )
    }

    #[tokio::test]
    async fn rejects_the_request_after_the_cap() {
        let store = InMemoryStore::new();
        let limiter = limiter(&store, 3, 60);
        for offset in 0..3 {
            limiter.assert_within_limit_at("alice", 1_000 + offset).await.unwrap();
        }
        let err = limiter.assert_within_limit_at("alice", 1_010).await.unwrap_err();
        // Oldest retained is 1_000, so the slot frees at 1_060.
        assert_eq!(err.retry_after(), Some(50));
    }

    #[tokio::test]
    async fn retry_after_is_never_below_one_second() {
        let store = InMemoryStore::new();
        let limiter = limiter(&store, 1, 10);
        limiter.assert_within_limit_at("bob", 100).await.unwrap();
        let err = limiter.assert_within_limit_at("bob", 110).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(1));
    }

    #[tokio::test]
    async fn old_timestamps_slide_out_of_the_window() {
        let store = InMemoryStore::new();
        let limiter = limiter(&store, 2, 60);
        limiter.assert_within_limit_at("carol", 0).await.unwrap();
        limiter.assert_within_limit_at("carol", 1).await.unwrap();
        assert!(limiter.assert_within_limit_at("carol", 30).await.is_err());
        limiter.assert_within_limit_at("carol", 61).await.unwrap();
    }

    #[tokio::test]
    async fn rejection_prunes_but_does_not_append() {
        let store = InMemoryStore::new();
        let limiter = limiter(&store, 1, 60);
        limiter.assert_within_limit_at("dave", 10).await.unwrap();
        assert!(limiter.assert_within_limit_at("dave", 20).await.is_err());
        let window = store.get(&window_key("dave")).await.unwrap().unwrap();
        assert_eq!(window, serde_json::json!([10]));
    }

    #[tokio::test]
    async fn users_are_limited_independently() {
        let store = InMemoryStore::new();
        let limiter = limiter(&store, 1, 60);
        limiter.assert_within_limit_at("erin", 5).await.unwrap();
        limiter.assert_within_limit_at("frank", 5).await.unwrap();
        assert!(limiter.assert_within_limit_at("erin", 6).await.is_err());
    }
}
