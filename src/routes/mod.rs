pub mod api_routes;
pub mod identity;
pub mod stream_routes;

use axum::routing::{delete, get, patch, post};
use axum::Router;

use crate::routes::api_routes::{
    archive_conversation_handler, cancel_message_handler, create_conversation_handler,
    list_conversations_handler, list_messages_handler, rename_conversation_handler,
    submit_prompt_handler,
};
use crate::routes::stream_routes::stream_message_handler;
use crate::service::chat_service::ChatService;

/// All HTTP routes. Middleware layers are added by the binary.
pub fn router(chat_service: ChatService) -> Router {
    Router::new()
        .route(
            "/api/conversations",
            get(list_conversations_handler).post(create_conversation_handler),
        )
        .route("/api/conversations/{id}", delete(archive_conversation_handler))
        .route("/api/conversations/{id}/title", patch(rename_conversation_handler))
        .route("/api/conversations/{id}/messages", get(list_messages_handler))
        .route("/api/conversations/{id}/prompt", post(submit_prompt_handler))
        .route("/api/messages/{id}/cancel", post(cancel_message_handler))
        .route("/api/stream/{conversation_id}/{message_id}", get(stream_message_handler))
        .with_state(chat_service)
}
