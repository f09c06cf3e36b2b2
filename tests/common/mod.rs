//! Shared fixtures: an in-memory service and scripted generation backends.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use rag_chat::config::{ChatConfig, RateLimitConfig};
use rag_chat::db::InMemoryChatRepository;
use rag_chat::errors::{AppError, AppResult};
use rag_chat::kv::memory::InMemoryStore;
use rag_chat::kv::SharedStore;
use rag_chat::models::{HistoryEntry, StreamEvent};
use rag_chat::service::chat_service::ChatService;
use rag_chat::upstream::{ByteStream, GenerationBackend};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const USER: &str = "user-1";

/// One item of a scripted upstream body.
#[derive(Debug, Clone)]
pub enum Step {
    Chunk(&'static str),
    Fail(&'static str),
}

/// What the backend was asked for.
#[derive(Debug, Clone)]
pub struct RecordedQuery {
    pub prompt: String,
    pub history: Vec<HistoryEntry>,
}

/// Replays the same body for every call.
#[derive(Default)]
pub struct ScriptedBackend {
    steps: Vec<Step>,
    calls: AtomicUsize,
    queries: Mutex<Vec<RecordedQuery>>,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self { steps, ..Default::default() })
    }

    pub fn chunks(chunks: &[&'static str]) -> Arc<Self> {
        Self::new(chunks.iter().map(|c| Step::Chunk(*c)).collect())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<RecordedQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn stream_query(&self, prompt: &str, history: &[HistoryEntry]) -> AppResult<ByteStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries
            .lock()
            .unwrap()
            .push(RecordedQuery { prompt: prompt.to_string(), history: history.to_vec() });
        let items: Vec<AppResult<Bytes>> = self
            .steps
            .iter()
            .map(|step| match step {
                Step::Chunk(text) => Ok(Bytes::from_static(text.as_bytes())),
                Step::Fail(message) => Err(AppError::upstream(*message)),
            })
            .collect();
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}

/// Backend whose body is fed by the test through a channel.
pub struct ChannelBackend {
    body: Mutex<Option<mpsc::Receiver<Bytes>>>,
}

impl ChannelBackend {
    pub fn new() -> (Arc<Self>, mpsc::Sender<Bytes>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(Self { body: Mutex::new(Some(rx)) }), tx)
    }
}

#[async_trait]
impl GenerationBackend for ChannelBackend {
    async fn stream_query(&self, _prompt: &str, _history: &[HistoryEntry]) -> AppResult<ByteStream> {
        let rx = self
            .body
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AppError::upstream("body already taken"))?;
        Ok(Box::pin(ReceiverStream::new(rx).map(Ok)))
    }
}

/// Backend that cannot be reached.
pub struct UnreachableBackend;

#[async_trait]
impl GenerationBackend for UnreachableBackend {
    async fn stream_query(&self, _prompt: &str, _history: &[HistoryEntry]) -> AppResult<ByteStream> {
        Err(AppError::UpstreamUnavailable { host: "rag.invalid".to_string() })
    }
}

pub struct Harness {
    pub service: ChatService,
    pub repo: InMemoryChatRepository,
    pub store: SharedStore,
}

pub fn test_config() -> ChatConfig {
    ChatConfig {
        history_limit: 10,
        dedup_window: chrono::Duration::seconds(5),
        cancellation_ttl: Duration::from_secs(60),
        rate_limit: RateLimitConfig { max_requests: 10, interval: Duration::from_secs(60) },
    }
}

pub fn harness(backend: Arc<dyn GenerationBackend>) -> Harness {
    harness_with(backend, test_config())
}

pub fn harness_with(backend: Arc<dyn GenerationBackend>, config: ChatConfig) -> Harness {
    let repo = InMemoryChatRepository::new();
    let store: SharedStore = Arc::new(InMemoryStore::new());
    let service = ChatService::new(Arc::new(repo.clone()), backend, store.clone(), config);
    Harness { service, repo, store }
}

/// Drains everything already sent on a finished stream.
pub fn drain(rx: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn done_count(events: &[StreamEvent]) -> usize {
    events.iter().filter(|e| **e == StreamEvent::Done).count()
}
