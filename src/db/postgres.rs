use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::error;

use super::conversation_repository::ConversationRepository;
use super::message_repository::MessageRepository;
use super::request_log_repository::RequestLogRepository;
use super::ChatRepository;
use crate::errors::{AppError, AppResult};
use crate::models::{Conversation, ConversationMessage, GenerationRequestLog, MessageRole, MessageStatus};

/// [`ChatRepository`] over the sqlx Postgres pool.
#[derive(Clone)]
pub struct PgChatRepository {
    pool: PgPool,
    conversations: ConversationRepository,
    messages: MessageRepository,
    logs: RequestLogRepository,
}

impl PgChatRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            conversations: ConversationRepository::new(pool.clone()),
            messages: MessageRepository::new(pool.clone()),
            logs: RequestLogRepository::new(pool.clone()),
            pool,
        }
    }
}

#[async_trait]
impl ChatRepository for PgChatRepository {
    async fn create_conversation(&self, conversation: &Conversation) -> AppResult<Conversation> {
        self.conversations.save(conversation).await
    }

    async fn find_owned_conversation(&self, id: &str, user_id: &str) -> AppResult<Option<Conversation>> {
        self.conversations.find_owned(id, user_id).await
    }

    async fn list_conversations(&self, user_id: &str) -> AppResult<Vec<Conversation>> {
        self.conversations.find_all_for_user(user_id).await
    }

    async fn rename_conversation(&self, id: &str, title: &str) -> AppResult<()> {
        self.conversations.update_title(id, title).await
    }

    async fn archive_conversation(&self, id: &str, at: DateTime<Utc>) -> AppResult<()> {
        self.conversations.soft_delete(id, at).await
    }

    async fn touch_conversation(&self, id: &str, at: DateTime<Utc>) -> AppResult<()> {
        self.conversations.update_activity(id, at).await
    }

    async fn insert_prompt_pair(
        &self,
        conversation_id: &str,
        new_title: Option<&str>,
        user_message: &ConversationMessage,
        assistant_message: &ConversationMessage,
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to open prompt transaction: {e}");
            AppError::db_query("Failed to begin transaction", e)
        })?;
        MessageRepository::insert(&mut tx, user_message).await?;
        MessageRepository::insert(&mut tx, assistant_message).await?;
        ConversationRepository::update_for_prompt(&mut tx, conversation_id, new_title, user_message.created_at)
            .await?;
        tx.commit()
            .await
            .map_err(|e| AppError::db_query("Failed to commit prompt transaction", e))
    }

    async fn find_message(&self, id: &str) -> AppResult<Option<ConversationMessage>> {
        self.messages.find_by_id(id).await
    }

    async fn list_messages(&self, conversation_id: &str) -> AppResult<Vec<ConversationMessage>> {
        self.messages.find_by_conversation_id(conversation_id).await
    }

    async fn latest_messages(&self, conversation_id: &str, limit: usize) -> AppResult<Vec<ConversationMessage>> {
        self.messages.find_latest(conversation_id, limit).await
    }

    async fn last_user_message(&self, conversation_id: &str) -> AppResult<Option<ConversationMessage>> {
        self.messages.find_newest(conversation_id, MessageRole::User, None, None).await
    }

    async fn find_recent_user_message(
        &self,
        conversation_id: &str,
        content: &str,
        since: DateTime<Utc>,
    ) -> AppResult<Option<ConversationMessage>> {
        self.messages
            .find_newest(conversation_id, MessageRole::User, Some(content), Some(since))
            .await
    }

    async fn find_reply_since(
        &self,
        conversation_id: &str,
        since: DateTime<Utc>,
    ) -> AppResult<Option<ConversationMessage>> {
        self.messages
            .find_oldest_since(conversation_id, MessageRole::Assistant, since)
            .await
    }

    async fn claim_stream(&self, message_id: &str, at: DateTime<Utc>) -> AppResult<bool> {
        self.messages.claim_stream(message_id, at).await
    }

    async fn append_content(&self, message_id: &str, text: &str) -> AppResult<bool> {
        self.messages.append_content(message_id, text).await
    }

    async fn replace_sources(&self, message_id: &str, sources: &[Value]) -> AppResult<bool> {
        self.messages.replace_sources(message_id, sources).await
    }

    async fn finish_message(
        &self,
        message_id: &str,
        status: MessageStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        self.messages.finish(message_id, status, error_message, at).await
    }

    async fn insert_request_log(&self, log: &GenerationRequestLog) -> AppResult<()> {
        self.logs.save(log).await
    }
}
