use sqlx::PgPool;
use tracing::error;

use crate::errors::AppError;
use crate::models::GenerationRequestLog;

#[derive(Clone)]
pub struct RequestLogRepository {
    pool: PgPool,
}

impl RequestLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn save(&self, log: &GenerationRequestLog) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO generation_request_logs
                (id, conversation_id, message_id, user_id, duration_ms, status, error_message, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&log.id)
        .bind(&log.conversation_id)
        .bind(&log.message_id)
        .bind(&log.user_id)
        .bind(log.duration_ms)
        .bind(log.status.as_str())
        .bind(&log.error_message)
        .bind(log.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save generation log for message {}: {e}", log.message_id);
            AppError::db_query("Failed to save generation log", e)
        })?;
        Ok(())
    }
}
