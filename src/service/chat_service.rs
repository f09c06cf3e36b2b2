use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cancellation::CancellationRegistry;
use crate::config::ChatConfig;
use crate::db::ChatRepository;
use crate::errors::{AppError, AppResult};
use crate::kv::SharedStore;
use crate::models::{
    title_from_prompt, Conversation, ConversationMessage, GenerationRequestLog, GenerationStatus,
    HistoryEntry, MessageRole, MessageStatus, PromptPair, StreamEvent, CANCELLED_BY_USER,
};
use crate::rate_limit::PromptRateLimiter;
use crate::upstream::{GenerationBackend, UpstreamEvent, UpstreamEventParser};

const MAX_PROMPT_LENGTH: usize = 8000;
const MAX_TITLE_LENGTH: usize = 255;
const UNKNOWN_UPSTREAM_ERROR: &str = "Unknown error from generation backend";
const ALREADY_STREAMING: &str = "A generation is already streaming for this message";

/// Where events of one streamed session are delivered, in order.
pub type EventSink = mpsc::Sender<StreamEvent>;

/// How a relay loop ended. Every variant goes through the same finalization.
#[derive(Debug)]
enum RelayOutcome {
    Completed,
    /// The backend sent an `error` record; the message is already marked.
    UpstreamError(String),
    Cancelled,
    Failed(AppError),
}

impl From<AppError> for RelayOutcome {
    fn from(err: AppError) -> Self {
        match err {
            AppError::StreamCancelled => RelayOutcome::Cancelled,
            other => RelayOutcome::Failed(other),
        }
    }
}

/// Conversation orchestrator: admits prompts, relays generations and
/// finalizes message state.
#[derive(Clone)]
pub struct ChatService {
    repo: Arc<dyn ChatRepository>,
    backend: Arc<dyn GenerationBackend>,
    rate_limiter: PromptRateLimiter,
    cancellations: CancellationRegistry,
    config: ChatConfig,
}

impl ChatService {
    pub fn new(
        repo: Arc<dyn ChatRepository>,
        backend: Arc<dyn GenerationBackend>,
        store: SharedStore,
        config: ChatConfig,
    ) -> Self {
        Self {
            rate_limiter: PromptRateLimiter::new(store.clone(), &config.rate_limit),
            cancellations: CancellationRegistry::new(store, config.cancellation_ttl),
            repo,
            backend,
            config,
        }
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    // ── Conversations ─────────────────────────────────────────────────────────

    pub async fn create_conversation(&self, user_id: &str, title: Option<String>) -> AppResult<Conversation> {
        if let Some(title) = &title {
            validate_length("title", title, MAX_TITLE_LENGTH)?;
        }
        let conversation = Conversation::new(user_id.to_string(), title);
        self.repo.create_conversation(&conversation).await
    }

    pub async fn get_conversations(&self, user_id: &str) -> AppResult<Vec<Conversation>> {
        self.repo.list_conversations(user_id).await
    }

    pub async fn get_conversation(&self, conversation_id: &str, user_id: &str) -> AppResult<Conversation> {
        self.repo
            .find_owned_conversation(conversation_id, user_id)
            .await?
            .ok_or_else(|| AppError::ConversationNotFound { id: conversation_id.to_string() })
    }

    pub async fn rename_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
        title: &str,
    ) -> AppResult<Conversation> {
        let mut conversation = self.get_conversation(conversation_id, user_id).await?;
        let title = title.trim();
        if title.is_empty() {
            return Err(AppError::EmptyField { field_name: "title".to_string() });
        }
        validate_length("title", title, MAX_TITLE_LENGTH)?;
        self.repo.rename_conversation(&conversation.id, title).await?;
        conversation.title = title.to_string();
        Ok(conversation)
    }

    pub async fn archive_conversation(&self, conversation_id: &str, user_id: &str) -> AppResult<()> {
        let conversation = self.get_conversation(conversation_id, user_id).await?;
        self.repo.archive_conversation(&conversation.id, Utc::now()).await
    }

    pub async fn get_messages(&self, conversation_id: &str, user_id: &str) -> AppResult<Vec<ConversationMessage>> {
        let conversation = self.get_conversation(conversation_id, user_id).await?;
        self.repo.list_messages(&conversation.id).await
    }

    /// Looks up an assistant message inside `conversation`.
    pub async fn find_assistant_message(
        &self,
        conversation: &Conversation,
        message_id: &str,
    ) -> AppResult<ConversationMessage> {
        self.repo
            .find_message(message_id)
            .await?
            .filter(|m| m.conversation_id == conversation.id && m.role == MessageRole::Assistant)
            .ok_or_else(|| AppError::MessageNotFound { id: message_id.to_string() })
    }

    // ── Prompt submission ─────────────────────────────────────────────────────

    /// Accepts a prompt: rate limit, duplicate guard, then the user message
    /// and its streaming assistant placeholder in one transaction.
    pub async fn submit_prompt(
        &self,
        conversation: &Conversation,
        user_id: &str,
        prompt: &str,
    ) -> AppResult<PromptPair> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(AppError::EmptyField { field_name: "prompt".to_string() });
        }
        validate_length("prompt", prompt, MAX_PROMPT_LENGTH)?;

        self.rate_limiter.assert_within_limit(user_id).await?;

        let now = Utc::now();
        if let Some(pair) = self.find_duplicate(conversation, prompt, now).await? {
            info!(
                "Duplicate prompt on conversation {}, reusing message {}",
                conversation.id, pair.assistant_message.id
            );
            return Ok(pair);
        }

        let new_title = conversation.has_default_title().then(|| title_from_prompt(prompt));
        let user_message = ConversationMessage::user(conversation.id.clone(), prompt.to_string(), now);
        let assistant_message = ConversationMessage::assistant_placeholder(conversation.id.clone(), now);
        self.repo
            .insert_prompt_pair(&conversation.id, new_title.as_deref(), &user_message, &assistant_message)
            .await?;

        debug!(
            "Accepted prompt on conversation {} (assistant message {})",
            conversation.id, assistant_message.id
        );
        Ok(PromptPair { user_message, assistant_message, deduplicated: false })
    }

    async fn find_duplicate(
        &self,
        conversation: &Conversation,
        prompt: &str,
        now: chrono::DateTime<Utc>,
    ) -> AppResult<Option<PromptPair>> {
        let since = now - self.config.dedup_window;
        let Some(user_message) = self.repo.find_recent_user_message(&conversation.id, prompt, since).await? else {
            return Ok(None);
        };
        let assistant = self
            .repo
            .find_reply_since(&conversation.id, user_message.created_at)
            .await?;
        Ok(assistant.map(|assistant_message| PromptPair {
            user_message,
            assistant_message,
            deduplicated: true,
        }))
    }

    // ── Streaming ─────────────────────────────────────────────────────────────

    /// Drives one stream for `message` and reports it to `sink`.
    ///
    /// Whatever happens, the last event sent is exactly one `done`.
    pub async fn stream_assistant_message(
        &self,
        conversation: &Conversation,
        message: &ConversationMessage,
        user_id: &str,
        sink: EventSink,
    ) {
        self.drive_stream(conversation, message, user_id, &sink).await;
        emit(&sink, StreamEvent::Done).await;
    }

    async fn drive_stream(
        &self,
        conversation: &Conversation,
        message: &ConversationMessage,
        user_id: &str,
        sink: &EventSink,
    ) {
        let current = match self.repo.find_message(&message.id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                let err = AppError::MessageNotFound { id: message.id.clone() };
                emit(sink, StreamEvent::Error { message: err.to_string() }).await;
                return;
            }
            Err(err) => {
                error!("Failed to load message {} before streaming: {err}", message.id);
                emit(sink, StreamEvent::Error { message: err.to_string() }).await;
                return;
            }
        };

        let cancelled = match self.cancellations.is_cancelled(&current.id).await {
            Ok(flag) => flag || current.is_cancelled(),
            Err(err) => {
                error!("Failed to read cancellation flag for {}: {err}", current.id);
                emit(sink, StreamEvent::Error { message: err.to_string() }).await;
                return;
            }
        };

        if !cancelled {
            if current.status.is_terminal() {
                debug!("Message {} is already {}, replaying it", current.id, current.status.as_str());
                replay(&current, sink).await;
                return;
            }
            match self.repo.claim_stream(&current.id, Utc::now()).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Refusing second stream for message {}", current.id);
                    emit(sink, StreamEvent::Error { message: ALREADY_STREAMING.to_string() }).await;
                    return;
                }
                Err(err) => {
                    emit(sink, StreamEvent::Error { message: err.to_string() }).await;
                    return;
                }
            }
        }

        let started = Instant::now();
        let mut log = GenerationRequestLog::open(&conversation.id, &current.id, user_id);

        let outcome = if cancelled {
            RelayOutcome::Cancelled
        } else {
            self.relay(conversation, &current, sink).await.unwrap_or_else(RelayOutcome::from)
        };
        self.finalize(conversation, &current, outcome, &mut log, sink).await;

        log.duration_ms = started.elapsed().as_millis() as i64;
        if let Err(err) = self.repo.insert_request_log(&log).await {
            error!("Failed to persist generation log for message {}: {err}", current.id);
        }
    }

    /// The relay loop: read a chunk, decode it, apply each event. Cancellation
    /// is polled before every chunk and before every event.
    async fn relay(
        &self,
        conversation: &Conversation,
        message: &ConversationMessage,
        sink: &EventSink,
    ) -> AppResult<RelayOutcome> {
        let history = self.build_history(conversation, message).await?;
        let prompt = self
            .repo
            .last_user_message(&conversation.id)
            .await?
            .and_then(|m| m.content)
            .unwrap_or_default();

        let mut body = self.backend.stream_query(&prompt, &history).await?;
        let mut parser = UpstreamEventParser::new();

        loop {
            self.ensure_not_cancelled(message).await?;
            let Some(chunk) = body.next().await else {
                break;
            };
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            debug!("Upstream chunk of {} bytes for message {}", chunk.len(), message.id);
            for event in parser.feed(&chunk) {
                if let Some(outcome) = self.apply_event(conversation, message, event, sink).await? {
                    return Ok(outcome);
                }
            }
        }

        for event in parser.finish() {
            if let Some(outcome) = self.apply_event(conversation, message, event, sink).await? {
                return Ok(outcome);
            }
        }
        Ok(RelayOutcome::Completed)
    }

    async fn ensure_not_cancelled(&self, message: &ConversationMessage) -> AppResult<()> {
        if self.cancellations.is_cancelled(&message.id).await? {
            return Err(AppError::StreamCancelled);
        }
        Ok(())
    }

    /// Applies one upstream event. Returns an outcome when the relay must stop.
    async fn apply_event(
        &self,
        conversation: &Conversation,
        message: &ConversationMessage,
        event: UpstreamEvent,
        sink: &EventSink,
    ) -> AppResult<Option<RelayOutcome>> {
        self.ensure_not_cancelled(message).await?;

        let stop = match event {
            UpstreamEvent::Token(text) => {
                self.repo.append_content(&message.id, &text).await?;
                emit(sink, StreamEvent::Token { text }).await;
                None
            }
            UpstreamEvent::Sources(sources) => {
                self.repo.replace_sources(&message.id, &sources).await?;
                emit(sink, StreamEvent::Sources { sources }).await;
                None
            }
            UpstreamEvent::Error(text) => {
                let text = if text.trim().is_empty() { UNKNOWN_UPSTREAM_ERROR.to_string() } else { text };
                let finished = self
                    .repo
                    .finish_message(&message.id, MessageStatus::Error, Some(&text), Utc::now())
                    .await?;
                // A cancel settled the message after the last poll.
                if !finished {
                    return Err(AppError::StreamCancelled);
                }
                error!(
                    "Generation backend returned an error for conversation {} message {}: {text}",
                    conversation.id, message.id
                );
                emit(sink, StreamEvent::Error { message: text.clone() }).await;
                Some(RelayOutcome::UpstreamError(text))
            }
        };

        self.repo.touch_conversation(&conversation.id, Utc::now()).await?;
        Ok(stop)
    }

    async fn finalize(
        &self,
        conversation: &Conversation,
        message: &ConversationMessage,
        outcome: RelayOutcome,
        log: &mut GenerationRequestLog,
        sink: &EventSink,
    ) {
        let now = Utc::now();
        match outcome {
            RelayOutcome::Completed => {
                match self.repo.finish_message(&message.id, MessageStatus::Completed, None, now).await {
                    Ok(true) => log.status = GenerationStatus::Success,
                    // Lost the race against a cancel request.
                    Ok(false) => {
                        log.status = GenerationStatus::Cancelled;
                        log.error_message = Some(CANCELLED_BY_USER.to_string());
                        emit(sink, StreamEvent::Error { message: CANCELLED_BY_USER.to_string() }).await;
                    }
                    Err(err) => {
                        error!("Failed to complete message {}: {err}", message.id);
                        log.status = GenerationStatus::Error;
                        log.error_message = Some(err.to_string());
                    }
                }
            }
            RelayOutcome::UpstreamError(text) => {
                log.status = GenerationStatus::Error;
                log.error_message = Some(text);
            }
            RelayOutcome::Cancelled => {
                info!("Generation for message {} cancelled by user", message.id);
                self.mark_failed(message, CANCELLED_BY_USER, now).await;
                log.status = GenerationStatus::Cancelled;
                log.error_message = Some(CANCELLED_BY_USER.to_string());
                emit(sink, StreamEvent::Error { message: CANCELLED_BY_USER.to_string() }).await;
            }
            RelayOutcome::Failed(err) => {
                let text = err.to_string();
                error!(
                    "Generation stream failed for conversation {} message {}: {text}",
                    conversation.id, message.id
                );
                self.mark_failed(message, &text, now).await;
                log.status = GenerationStatus::Error;
                log.error_message = Some(text.clone());
                emit(sink, StreamEvent::Error { message: text }).await;
            }
        }

        if let Err(err) = self.repo.touch_conversation(&conversation.id, now).await {
            error!("Failed to bump activity of conversation {}: {err}", conversation.id);
        }
    }

    async fn mark_failed(&self, message: &ConversationMessage, text: &str, at: chrono::DateTime<Utc>) {
        if let Err(err) = self.repo.finish_message(&message.id, MessageStatus::Error, Some(text), at).await {
            error!("Failed to mark message {} as errored: {err}", message.id);
        }
    }

    /// Most recent history in chronological order, without the placeholder.
    async fn build_history(
        &self,
        conversation: &Conversation,
        skip: &ConversationMessage,
    ) -> AppResult<Vec<HistoryEntry>> {
        let mut latest = self.repo.latest_messages(&conversation.id, self.config.history_limit).await?;
        latest.reverse();
        Ok(latest
            .into_iter()
            .filter(|m| m.id != skip.id)
            .map(|m| HistoryEntry { role: m.role.as_str().to_string(), content: m.content })
            .collect())
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    /// Stops an assistant message. Safe to repeat: a terminal message keeps
    /// its state and only the flag is refreshed.
    pub async fn cancel_assistant_message(&self, message: &ConversationMessage) -> AppResult<()> {
        if message.role != MessageRole::Assistant {
            return Err(AppError::MessageNotFound { id: message.id.clone() });
        }
        let now = Utc::now();
        let transitioned = self
            .repo
            .finish_message(&message.id, MessageStatus::Error, Some(CANCELLED_BY_USER), now)
            .await?;
        self.cancellations.cancel(&message.id).await?;
        self.repo.touch_conversation(&message.conversation_id, now).await?;
        if !transitioned {
            debug!("Message {} was already terminal when cancelled", message.id);
        }
        Ok(())
    }

    /// Cancels `message_id` on behalf of `user_id`, who must own its conversation.
    pub async fn cancel_for_user(&self, message_id: &str, user_id: &str) -> AppResult<()> {
        let message = self
            .repo
            .find_message(message_id)
            .await?
            .filter(|m| m.role == MessageRole::Assistant)
            .ok_or_else(|| AppError::MessageNotFound { id: message_id.to_string() })?;
        self.repo
            .find_owned_conversation(&message.conversation_id, user_id)
            .await?
            .ok_or_else(|| AppError::MessageNotFound { id: message_id.to_string() })?;
        self.cancel_assistant_message(&message).await
    }
}

fn validate_length(field_name: &str, value: &str, max_length: usize) -> AppResult<()> {
    let actual_length = value.chars().count();
    if actual_length > max_length {
        return Err(AppError::FieldTooLong { field_name: field_name.to_string(), max_length, actual_length });
    }
    Ok(())
}

/// Re-sends the stored state of a terminal message.
async fn replay(message: &ConversationMessage, sink: &EventSink) {
    if let Some(content) = message.content.as_deref().filter(|c| !c.is_empty()) {
        emit(sink, StreamEvent::Token { text: content.to_string() }).await;
    }
    if !message.source_documents.is_empty() {
        emit(sink, StreamEvent::Sources { sources: message.source_documents.clone() }).await;
    }
    if message.status == MessageStatus::Error {
        let text = message.error_message.clone().unwrap_or_else(|| UNKNOWN_UPSTREAM_ERROR.to_string());
        emit(sink, StreamEvent::Error { message: text }).await;
    }
}

async fn emit(sink: &EventSink, event: StreamEvent) {
    let name = event.name();
    if sink.send(event).await.is_err() {
        debug!("Stream client disconnected, dropping {name} event");
    }
}
