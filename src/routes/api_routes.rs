use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, warn};

use crate::errors::AppError;
use crate::models::{
    CreateConversationRequest, MessageView, PromptAccepted, PromptRequest, RateLimitedResponse,
    RenameConversationRequest, StatusMessage,
};
use crate::routes::identity::CurrentUser;
use crate::service::chat_service::ChatService;

// ── Conversations ─────────────────────────────────────────────────────────────

/// POST `/api/conversations`: start an empty conversation
pub async fn create_conversation_handler(
    State(svc): State<ChatService>,
    CurrentUser(user_id): CurrentUser,
    body: Option<Json<CreateConversationRequest>>,
) -> Result<Response, AppError> {
    let title = body.and_then(|Json(req)| req.title);
    let conversation = svc.create_conversation(&user_id, title).await?;
    Ok((StatusCode::CREATED, Json(conversation)).into_response())
}

/// GET `/api/conversations`: the caller's conversations, most recent first
pub async fn list_conversations_handler(
    State(svc): State<ChatService>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Response, AppError> {
    let conversations = svc.get_conversations(&user_id).await?;
    Ok(Json(conversations).into_response())
}

/// PATCH `/api/conversations/{id}/title`
pub async fn rename_conversation_handler(
    State(svc): State<ChatService>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<RenameConversationRequest>,
) -> Result<Response, AppError> {
    let conversation = svc.rename_conversation(&id, &user_id, &req.title).await?;
    Ok(Json(conversation).into_response())
}

/// DELETE `/api/conversations/{id}`: archive; the conversation disappears from listings
pub async fn archive_conversation_handler(
    State(svc): State<ChatService>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    svc.archive_conversation(&id, &user_id).await?;
    Ok(Json(StatusMessage { message: "Conversation archived.".to_string() }).into_response())
}

/// GET `/api/conversations/{id}/messages`
pub async fn list_messages_handler(
    State(svc): State<ChatService>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let messages = svc.get_messages(&id, &user_id).await?;
    let views: Vec<MessageView> = messages.into_iter().map(MessageView::from).collect();
    Ok(Json(views).into_response())
}

// ── Prompts ───────────────────────────────────────────────────────────────────

/// POST `/api/conversations/{id}/prompt`: accept a prompt for streaming
pub async fn submit_prompt_handler(
    State(svc): State<ChatService>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<PromptRequest>,
) -> Result<Response, AppError> {
    let conversation = svc.get_conversation(&id, &user_id).await?;
    let prompt = req.prompt.unwrap_or_default();
    let pair = svc.submit_prompt(&conversation, &user_id, &prompt).await?;

    let accepted = PromptAccepted {
        conversation_id: conversation.id,
        user_message_id: pair.user_message.id,
        assistant_message_id: pair.assistant_message.id,
    };
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

/// POST `/api/messages/{id}/cancel`
pub async fn cancel_message_handler(
    State(svc): State<ChatService>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    svc.cancel_for_user(&id, &user_id).await?;
    Ok(Json(StatusMessage { message: "cancelled_by_user".to_string() }).into_response())
}

// ── Helper ────────────────────────────────────────────────────────────────────

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error_response(&self)
    }
}

pub fn error_response(err: &AppError) -> Response {
    if let Some(retry_after) = err.retry_after() {
        warn!("Rejecting prompt: {err}");
        let body = RateLimitedResponse {
            message: "Too many prompts. Please wait before sending another one.".to_string(),
            retry_after,
        };
        let mut resp = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        resp.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        return resp;
    }

    let status = if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if matches!(err, AppError::Unauthenticated) {
        StatusCode::UNAUTHORIZED
    } else if matches!(err, AppError::UpstreamUnavailable { .. }) {
        StatusCode::SERVICE_UNAVAILABLE
    } else if err.is_upstream() {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    if status.is_server_error() {
        error!("Request failed: {err}");
    }
    (status, Json(StatusMessage { message: err.to_string() })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_carries_retry_after_header() {
        let resp = error_response(&AppError::RateLimitExceeded { retry_after_seconds: 42 });
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "42");
    }

    #[test]
    fn maps_error_classes_to_statuses() {
        let cases = [
            (AppError::EmptyField { field_name: "prompt".into() }, StatusCode::BAD_REQUEST),
            (AppError::ConversationNotFound { id: "c".into() }, StatusCode::NOT_FOUND),
            (AppError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (AppError::UpstreamUnavailable { host: "rag".into() }, StatusCode::SERVICE_UNAVAILABLE),
            (AppError::upstream("HTTP 500"), StatusCode::BAD_GATEWAY),
            (AppError::Unexpected("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(error_response(&err).status(), status, "{err}");
        }
    }
}
