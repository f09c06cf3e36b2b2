use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::error;

use crate::errors::AppError;
use crate::models::{ConversationMessage, MessageRole, MessageStatus};

const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, source_documents, status, \
                               error_message, streamed_at, finished_at, created_at";

#[derive(Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

impl MessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<ConversationMessage>, AppError> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM conversation_messages WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to fetch message {id}: {e}");
                AppError::db_query(format!("Failed to fetch message {id}"), e)
            })?;
        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn find_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ConversationMessage>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM conversation_messages
             WHERE conversation_id = $1
             ORDER BY created_at ASC, seq ASC"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch messages for conversation {conversation_id}: {e}");
            AppError::db_query(
                format!("Failed to fetch messages for conversation {conversation_id}"),
                e,
            )
        })?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn find_latest(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM conversation_messages
             WHERE conversation_id = $1
             ORDER BY created_at DESC, seq DESC
             LIMIT $2"
        ))
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::db_query("Failed to fetch latest messages", e))?;
        rows.iter().map(message_from_row).collect()
    }

    /// Newest message matching the filters; `content` and `since` are optional.
    pub async fn find_newest(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<ConversationMessage>, AppError> {
        self.find_first(conversation_id, role, content, since, "DESC").await
    }

    /// Oldest message of `role` created at or after `since`.
    pub async fn find_oldest_since(
        &self,
        conversation_id: &str,
        role: MessageRole,
        since: DateTime<Utc>,
    ) -> Result<Option<ConversationMessage>, AppError> {
        self.find_first(conversation_id, role, None, Some(since), "ASC").await
    }

    async fn find_first(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: Option<&str>,
        since: Option<DateTime<Utc>>,
        direction: &str,
    ) -> Result<Option<ConversationMessage>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM conversation_messages
             WHERE conversation_id = $1
               AND role = $2
               AND ($3::TEXT IS NULL OR content = $3)
               AND ($4::TIMESTAMPTZ IS NULL OR created_at >= $4)
             ORDER BY created_at {direction}, seq {direction}
             LIMIT 1"
        ))
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to look up {role} message in conversation {conversation_id}: {e}");
            AppError::db_query("Failed to look up message", e)
        })?;
        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        message: &ConversationMessage,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO conversation_messages
                (id, conversation_id, role, content, source_documents, status,
                 error_message, streamed_at, finished_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(Value::from(message.source_documents.clone()))
        .bind(message.status.as_str())
        .bind(&message.error_message)
        .bind(message.streamed_at)
        .bind(message.finished_at)
        .bind(message.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            error!("Failed to save message {}: {e}", message.id);
            AppError::db_query("Failed to save message", e)
        })?;
        Ok(())
    }

    pub async fn claim_stream(&self, id: &str, at: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE conversation_messages SET streamed_at = $1
             WHERE id = $2 AND status = 'streaming' AND streamed_at IS NULL",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::db_query("Failed to claim message stream", e))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn append_content(&self, id: &str, text: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE conversation_messages SET content = COALESCE(content, '') || $1
             WHERE id = $2 AND status = 'streaming'",
        )
        .bind(text)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to append content to message {id}: {e}");
            AppError::db_query("Failed to append message content", e)
        })?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn replace_sources(&self, id: &str, sources: &[Value]) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE conversation_messages SET source_documents = $1
             WHERE id = $2 AND status = 'streaming'",
        )
        .bind(Value::from(sources.to_vec()))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::db_query("Failed to store message sources", e))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn finish(
        &self,
        id: &str,
        status: MessageStatus,
        error_message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE conversation_messages
             SET status = $1, error_message = $2, finished_at = $3
             WHERE id = $4 AND status = 'streaming'",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to finish message {id}: {e}");
            AppError::db_query("Failed to update message status", e)
        })?;
        Ok(result.rows_affected() == 1)
    }
}

fn message_from_row(row: &PgRow) -> Result<ConversationMessage, AppError> {
    let role_str: String = row.try_get("role").map_err(|e| AppError::db_query("Failed to read role", e))?;
    let role = MessageRole::try_from(role_str)
        .map_err(|e| AppError::Unexpected(format!("Unknown message role: {e}")))?;
    let status_str: String = row
        .try_get("status")
        .map_err(|e| AppError::db_query("Failed to read status", e))?;
    let status = MessageStatus::try_from(status_str).map_err(AppError::Unexpected)?;
    let sources: Option<Value> = row
        .try_get("source_documents")
        .map_err(|e| AppError::db_query("Failed to read source_documents", e))?;
    let source_documents = match sources {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };

    Ok(ConversationMessage {
        id: row.try_get("id").map_err(|e| AppError::db_query("Failed to read id", e))?,
        conversation_id: row
            .try_get("conversation_id")
            .map_err(|e| AppError::db_query("Failed to read conversation_id", e))?,
        role,
        content: row.try_get("content").map_err(|e| AppError::db_query("Failed to read content", e))?,
        source_documents,
        status,
        error_message: row
            .try_get("error_message")
            .map_err(|e| AppError::db_query("Failed to read error_message", e))?,
        streamed_at: row
            .try_get("streamed_at")
            .map_err(|e| AppError::db_query("Failed to read streamed_at", e))?,
        finished_at: row
            .try_get("finished_at")
            .map_err(|e| AppError::db_query("Failed to read finished_at", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| AppError::db_query("Failed to read created_at", e))?,
    })
}
