use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use super::ChatRepository;
use crate::errors::{AppError, AppResult};
use crate::models::{Conversation, ConversationMessage, GenerationRequestLog, MessageRole, MessageStatus};

#[derive(Default)]
struct Tables {
    conversations: Vec<Conversation>,
    /// Insertion order doubles as the sequence column.
    messages: Vec<ConversationMessage>,
    logs: Vec<GenerationRequestLog>,
}

/// [`ChatRepository`] kept in process memory, for tests and local demos.
#[derive(Clone, Default)]
pub struct InMemoryChatRepository {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryChatRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every generation log written so far, oldest first.
    pub async fn request_logs(&self) -> Vec<GenerationRequestLog> {
        self.tables.read().await.logs.clone()
    }

    pub async fn conversation(&self, id: &str) -> Option<Conversation> {
        self.tables.read().await.conversations.iter().find(|c| c.id == id).cloned()
    }

    fn newest<'a>(
        messages: &'a [ConversationMessage],
        conversation_id: &str,
        predicate: impl Fn(&ConversationMessage) -> bool,
    ) -> Option<&'a ConversationMessage> {
        messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.conversation_id == conversation_id && predicate(m))
            .max_by_key(|(seq, m)| (m.created_at, *seq))
            .map(|(_, m)| m)
    }

    /// Applies `update` to a message that is still streaming.
    async fn update_streaming(
        &self,
        message_id: &str,
        update: impl FnOnce(&mut ConversationMessage),
    ) -> AppResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) if message.status == MessageStatus::Streaming => {
                update(message);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(AppError::MessageNotFound { id: message_id.to_string() }),
        }
    }
}

#[async_trait]
impl ChatRepository for InMemoryChatRepository {
    async fn create_conversation(&self, conversation: &Conversation) -> AppResult<Conversation> {
        self.tables.write().await.conversations.push(conversation.clone());
        Ok(conversation.clone())
    }

    async fn find_owned_conversation(&self, id: &str, user_id: &str) -> AppResult<Option<Conversation>> {
        Ok(self
            .tables
            .read()
            .await
            .conversations
            .iter()
            .find(|c| c.id == id && c.user_id == user_id && c.deleted_at.is_none())
            .cloned())
    }

    async fn list_conversations(&self, user_id: &str) -> AppResult<Vec<Conversation>> {
        let mut conversations: Vec<Conversation> = self
            .tables
            .read()
            .await
            .conversations
            .iter()
            .filter(|c| c.user_id == user_id && c.deleted_at.is_none())
            .cloned()
            .collect();
        conversations.sort_by(|a, b| {
            b.last_activity_at.cmp(&a.last_activity_at).then(b.created_at.cmp(&a.created_at))
        });
        Ok(conversations)
    }

    async fn rename_conversation(&self, id: &str, title: &str) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(conversation) = tables.conversations.iter_mut().find(|c| c.id == id) {
            conversation.title = title.to_string();
        }
        Ok(())
    }

    async fn archive_conversation(&self, id: &str, at: DateTime<Utc>) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(conversation) = tables.conversations.iter_mut().find(|c| c.id == id) {
            conversation.deleted_at.get_or_insert(at);
        }
        Ok(())
    }

    async fn touch_conversation(&self, id: &str, at: DateTime<Utc>) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(conversation) = tables.conversations.iter_mut().find(|c| c.id == id) {
            conversation.last_activity_at = conversation.last_activity_at.max(at);
        }
        Ok(())
    }

    async fn insert_prompt_pair(
        &self,
        conversation_id: &str,
        new_title: Option<&str>,
        user_message: &ConversationMessage,
        assistant_message: &ConversationMessage,
    ) -> AppResult<()> {
        // One write guard makes the three changes visible together.
        let mut tables = self.tables.write().await;
        let conversation = tables
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| AppError::ConversationNotFound { id: conversation_id.to_string() })?;
        if let Some(title) = new_title {
            conversation.title = title.to_string();
        }
        conversation.last_activity_at = conversation.last_activity_at.max(user_message.created_at);
        tables.messages.push(user_message.clone());
        tables.messages.push(assistant_message.clone());
        Ok(())
    }

    async fn find_message(&self, id: &str) -> AppResult<Option<ConversationMessage>> {
        Ok(self.tables.read().await.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn list_messages(&self, conversation_id: &str) -> AppResult<Vec<ConversationMessage>> {
        let mut messages: Vec<(usize, ConversationMessage)> = self
            .tables
            .read()
            .await
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.conversation_id == conversation_id)
            .map(|(seq, m)| (seq, m.clone()))
            .collect();
        messages.sort_by_key(|(seq, m)| (m.created_at, *seq));
        Ok(messages.into_iter().map(|(_, m)| m).collect())
    }

    async fn latest_messages(&self, conversation_id: &str, limit: usize) -> AppResult<Vec<ConversationMessage>> {
        let mut messages = self.list_messages(conversation_id).await?;
        messages.reverse();
        messages.truncate(limit);
        Ok(messages)
    }

    async fn last_user_message(&self, conversation_id: &str) -> AppResult<Option<ConversationMessage>> {
        let tables = self.tables.read().await;
        Ok(Self::newest(&tables.messages, conversation_id, |m| m.role == MessageRole::User).cloned())
    }

    async fn find_recent_user_message(
        &self,
        conversation_id: &str,
        content: &str,
        since: DateTime<Utc>,
    ) -> AppResult<Option<ConversationMessage>> {
        let tables = self.tables.read().await;
        Ok(Self::newest(&tables.messages, conversation_id, |m| {
            m.role == MessageRole::User && m.created_at >= since && m.content.as_deref() == Some(content)
        })
        .cloned())
    }

    async fn find_reply_since(
        &self,
        conversation_id: &str,
        since: DateTime<Utc>,
    ) -> AppResult<Option<ConversationMessage>> {
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.conversation_id == conversation_id && m.role == MessageRole::Assistant && m.created_at >= since
            })
            .min_by_key(|(seq, m)| (m.created_at, *seq))
            .map(|(_, m)| m.clone()))
    }

    async fn claim_stream(&self, message_id: &str, at: DateTime<Utc>) -> AppResult<bool> {
        let mut claimed = false;
        self.update_streaming(message_id, |m| {
            if m.streamed_at.is_none() {
                m.streamed_at = Some(at);
                claimed = true;
            }
        })
        .await?;
        Ok(claimed)
    }

    async fn append_content(&self, message_id: &str, text: &str) -> AppResult<bool> {
        self.update_streaming(message_id, |m| m.content.get_or_insert_with(String::new).push_str(text))
            .await
    }

    async fn replace_sources(&self, message_id: &str, sources: &[Value]) -> AppResult<bool> {
        self.update_streaming(message_id, |m| m.source_documents = sources.to_vec()).await
    }

    async fn finish_message(
        &self,
        message_id: &str,
        status: MessageStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> AppResult<bool> {
        self.update_streaming(message_id, |m| {
            m.status = status;
            m.error_message = error_message.map(str::to_string);
            m.finished_at = Some(at);
        })
        .await
    }

    async fn insert_request_log(&self, log: &GenerationRequestLog) -> AppResult<()> {
        self.tables.write().await.logs.push(log.clone());
        Ok(())
    }
}
