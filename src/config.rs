use std::str::FromStr;
use std::time::Duration;

use crate::errors::AppError;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_RAG_BASE_URL: &str = "http://localhost:9621";
const DEFAULT_QUERY_MODE: &str = "mix";
const DEFAULT_RAG_TIMEOUT_SECS: u64 = 300;
const DEFAULT_HISTORY_LIMIT: usize = 10;
const DEFAULT_RATE_LIMIT_MAX: usize = 10;
const DEFAULT_RATE_LIMIT_INTERVAL_SECS: u64 = 60;
const DEFAULT_DEDUP_WINDOW_SECS: i64 = 5;
const DEFAULT_CANCELLATION_TTL_SECS: u64 = 300;

/// Which backend holds the rate-limit windows and cancellation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvBackend {
    /// Process-local map, only correct for single-instance deployments.
    Memory,
    /// `kv_entries` table, shared by every instance using the same database.
    Postgres,
}

impl FromStr for KvBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(KvBackend::Memory),
            "postgres" | "postgresql" => Ok(KvBackend::Postgres),
            other => Err(AppError::Config(format!("unknown KV_BACKEND '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_RATE_LIMIT_MAX,
            interval: Duration::from_secs(DEFAULT_RATE_LIMIT_INTERVAL_SECS),
        }
    }
}

/// Tunables of the conversational pipeline that are independent of I/O wiring.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub history_limit: usize,
    pub dedup_window: chrono::Duration,
    pub cancellation_ttl: Duration,
    pub rate_limit: RateLimitConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            dedup_window: chrono::Duration::seconds(DEFAULT_DEDUP_WINDOW_SECS),
            cancellation_ttl: Duration::from_secs(DEFAULT_CANCELLATION_TTL_SECS),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub query_mode: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub kv_backend: KvBackend,
    pub cors_allowed_origin: Option<String>,
    pub upstream: UpstreamConfig,
    pub chat: ChatConfig,
}

impl AppConfig {
    /// Reads the configuration from the process environment.
    /// Call `dotenvy::dotenv()` first to pick up a local `.env`.
    pub fn from_env() -> Result<Self, AppError> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| AppError::Config("DATABASE_URL must be set".to_string()))?;

        let chat = ChatConfig {
            history_limit: parse_var("CHAT_HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT)?,
            dedup_window: chrono::Duration::seconds(parse_var(
                "PROMPT_DEDUP_WINDOW_SECS",
                DEFAULT_DEDUP_WINDOW_SECS,
            )?),
            cancellation_ttl: Duration::from_secs(parse_var(
                "CANCELLATION_TTL_SECS",
                DEFAULT_CANCELLATION_TTL_SECS,
            )?),
            rate_limit: RateLimitConfig {
                max_requests: parse_var("PROMPT_RATE_LIMIT_MAX", DEFAULT_RATE_LIMIT_MAX)?,
                interval: Duration::from_secs(parse_var(
                    "PROMPT_RATE_LIMIT_INTERVAL_SECS",
                    DEFAULT_RATE_LIMIT_INTERVAL_SECS,
                )?),
            },
        };

        Ok(Self {
            database_url,
            port: parse_var("PORT", DEFAULT_PORT)?,
            kv_backend: parse_var("KV_BACKEND", KvBackend::Memory)?,
            cors_allowed_origin: std::env::var("CORS_ALLOWED_ORIGIN").ok(),
            upstream: UpstreamConfig {
                base_url: std::env::var("RAG_API_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_RAG_BASE_URL.to_string()),
                query_mode: std::env::var("RAG_QUERY_MODE")
                    .unwrap_or_else(|_| DEFAULT_QUERY_MODE.to_string()),
                timeout: Duration::from_secs(parse_var("RAG_TIMEOUT_SECS", DEFAULT_RAG_TIMEOUT_SECS)?),
            },
            chat,
        })
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{name} has an invalid value '{raw}'"))),
        _ => Ok(default),
    }
}
