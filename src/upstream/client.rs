use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, error};

use crate::config::UpstreamConfig;
use crate::errors::{AppError, AppResult};
use crate::models::HistoryEntry;

/// Raw response body of the generation backend, chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = AppResult<Bytes>> + Send>>;

/// Request body of `POST /query/stream`.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamQuery<'a> {
    pub query: &'a str,
    pub conversation_history: &'a [HistoryEntry],
    pub mode: &'a str,
    pub enable_rerank: bool,
}

/// The retrieval-augmented generation service the relay loop reads from.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Starts a generation and returns its undecoded response body.
    async fn stream_query(&self, prompt: &str, history: &[HistoryEntry]) -> AppResult<ByteStream>;
}

/// HTTP client for a LightRAG-style `/query/stream` endpoint.
#[derive(Clone)]
pub struct RagClient {
    http: reqwest::Client,
    base_url: String,
    mode: String,
}

impl RagClient {
    pub fn new(config: &UpstreamConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .build()
            .map_err(|e| AppError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            mode: config.query_mode.clone(),
        })
    }

    fn stream_url(&self) -> String {
        format!("{}/query/stream", self.base_url)
    }
}

#[async_trait]
impl GenerationBackend for RagClient {
    async fn stream_query(&self, prompt: &str, history: &[HistoryEntry]) -> AppResult<ByteStream> {
        let body = UpstreamQuery {
            query: prompt,
            conversation_history: history,
            mode: &self.mode,
            enable_rerank: false,
        };
        debug!("Opening upstream stream with {} history entries", history.len());

        let response = self
            .http
            .post(self.stream_url())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Generation backend request failed: {e}");
                AppError::from(e)
            })?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(AppError::upstream(format!(
                "generation backend responded with HTTP {}",
                status.as_u16()
            )));
        }

        Ok(Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(AppError::from))))
    }
}
