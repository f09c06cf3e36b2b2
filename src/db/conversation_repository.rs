use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::error;

use crate::errors::AppError;
use crate::models::Conversation;

const CONVERSATION_COLUMNS: &str = "id, user_id, title, last_activity_at, created_at, deleted_at";

#[derive(Clone)]
pub struct ConversationRepository {
    pool: PgPool,
}

impl ConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_all_for_user(&self, user_id: &str) -> Result<Vec<Conversation>, AppError> {
        sqlx::query_as::<_, Conversation>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE user_id = $1 AND deleted_at IS NULL
             ORDER BY last_activity_at DESC, created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch conversations for user {user_id}: {e}");
            AppError::db_query("Failed to fetch conversations", e)
        })
    }

    pub async fn find_owned(&self, id: &str, user_id: &str) -> Result<Option<Conversation>, AppError> {
        sqlx::query_as::<_, Conversation>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL"
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find conversation {id}: {e}");
            AppError::db_query(format!("Failed to find conversation {id}"), e)
        })
    }

    pub async fn save(&self, conversation: &Conversation) -> Result<Conversation, AppError> {
        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, last_activity_at, created_at, deleted_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&conversation.id)
        .bind(&conversation.user_id)
        .bind(&conversation.title)
        .bind(conversation.last_activity_at)
        .bind(conversation.created_at)
        .bind(conversation.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save conversation {}: {e}", conversation.id);
            AppError::db_query("Failed to save conversation", e)
        })?;
        Ok(conversation.clone())
    }

    pub async fn update_title(&self, id: &str, title: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE conversations SET title = $1 WHERE id = $2")
            .bind(title)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to rename conversation {id}: {e}");
                AppError::db_query("Failed to rename conversation", e)
            })?;
        Ok(())
    }

    pub async fn soft_delete(&self, id: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE conversations SET deleted_at = $1 WHERE id = $2 AND deleted_at IS NULL")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to archive conversation {id}: {e}");
                AppError::db_query("Failed to archive conversation", e)
            })?;
        Ok(())
    }

    pub async fn update_activity(&self, id: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE conversations SET last_activity_at = GREATEST(last_activity_at, $1) WHERE id = $2",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update conversation activity {id}: {e}");
            AppError::db_query("Failed to update conversation", e)
        })?;
        Ok(())
    }

    /// Title and activity update that runs inside the prompt transaction.
    pub async fn update_for_prompt(
        tx: &mut Transaction<'_, Postgres>,
        id: &str,
        new_title: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE conversations
             SET title = COALESCE($1, title),
                 last_activity_at = GREATEST(last_activity_at, $2)
             WHERE id = $3",
        )
        .bind(new_title)
        .bind(at)
        .bind(id)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            error!("Failed to update conversation {id} for prompt: {e}");
            AppError::db_query("Failed to update conversation", e)
        })?;
        Ok(())
    }
}
