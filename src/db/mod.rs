//! Persistence for conversations, messages and generation logs.
//!
//! [`ChatRepository`] is the seam the orchestrator depends on. Message status
//! transitions are conditional on the row still being `streaming`, so a
//! terminal message can never be rewritten, whichever caller gets there last.

pub mod conversation_repository;
pub mod memory;
pub mod message_repository;
pub mod postgres;
pub mod request_log_repository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::AppResult;
use crate::models::{Conversation, ConversationMessage, GenerationRequestLog, MessageStatus};

pub use memory::InMemoryChatRepository;
pub use postgres::PgChatRepository;

#[async_trait]
pub trait ChatRepository: Send + Sync {
    // ── Conversations ────────────────────────────────────────────────────────
    async fn create_conversation(&self, conversation: &Conversation) -> AppResult<Conversation>;

    /// The conversation if it exists, belongs to `user_id` and is not archived.
    async fn find_owned_conversation(&self, id: &str, user_id: &str) -> AppResult<Option<Conversation>>;

    /// Live conversations of `user_id`, most recently active first.
    async fn list_conversations(&self, user_id: &str) -> AppResult<Vec<Conversation>>;

    async fn rename_conversation(&self, id: &str, title: &str) -> AppResult<()>;

    async fn archive_conversation(&self, id: &str, at: DateTime<Utc>) -> AppResult<()>;

    /// Moves `last_activity_at` forward to `at`; never moves it backwards.
    async fn touch_conversation(&self, id: &str, at: DateTime<Utc>) -> AppResult<()>;

    // ── Messages ─────────────────────────────────────────────────────────────
    /// Inserts a user message and its assistant placeholder atomically, and in
    /// the same transaction sets the title (when given) and bumps activity.
    async fn insert_prompt_pair(
        &self,
        conversation_id: &str,
        new_title: Option<&str>,
        user_message: &ConversationMessage,
        assistant_message: &ConversationMessage,
    ) -> AppResult<()>;

    async fn find_message(&self, id: &str) -> AppResult<Option<ConversationMessage>>;

    /// All messages in conversation order.
    async fn list_messages(&self, conversation_id: &str) -> AppResult<Vec<ConversationMessage>>;

    /// At most `limit` messages, newest first.
    async fn latest_messages(&self, conversation_id: &str, limit: usize) -> AppResult<Vec<ConversationMessage>>;

    async fn last_user_message(&self, conversation_id: &str) -> AppResult<Option<ConversationMessage>>;

    /// Newest user message with exactly `content` created at or after `since`.
    async fn find_recent_user_message(
        &self,
        conversation_id: &str,
        content: &str,
        since: DateTime<Utc>,
    ) -> AppResult<Option<ConversationMessage>>;

    /// Oldest assistant message created at or after `since`. Passing a user
    /// message's `created_at` yields the reply inserted alongside it.
    async fn find_reply_since(
        &self,
        conversation_id: &str,
        since: DateTime<Utc>,
    ) -> AppResult<Option<ConversationMessage>>;

    /// Records `streamed_at` if no stream has been opened for this still
    /// streaming message yet. Returns whether this caller won the claim.
    async fn claim_stream(&self, message_id: &str, at: DateTime<Utc>) -> AppResult<bool>;

    /// Appends to `content` while the message is streaming.
    async fn append_content(&self, message_id: &str, text: &str) -> AppResult<bool>;

    /// Replaces `source_documents` while the message is streaming.
    async fn replace_sources(&self, message_id: &str, sources: &[Value]) -> AppResult<bool>;

    /// Moves a streaming message to a terminal `status`. Returns `false` when
    /// the message was already terminal and nothing changed.
    async fn finish_message(
        &self,
        message_id: &str,
        status: MessageStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> AppResult<bool>;

    // ── Generation logs ──────────────────────────────────────────────────────
    async fn insert_request_log(&self, log: &GenerationRequestLog) -> AppResult<()>;
}
