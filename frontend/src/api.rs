use gloo_net::http::{Request, RequestBuilder, Response};

use crate::models::{ApiError, Conversation, Message, PromptAccepted, PromptRequest};

/// Base URL of the backend API server.
const API_BASE: &str = "http://localhost:3000";
const USER_ID_HEADER: &str = "X-User-Id";
const USER_STORAGE_KEY: &str = "rag-chat-user";

/// Identity sent with every request. Persisted in local storage so a reload
/// keeps the same conversations.
pub fn current_user() -> String {
    let storage = web_sys::window().and_then(|w| w.local_storage().ok().flatten());
    if let Some(existing) = storage.as_ref().and_then(|s| s.get_item(USER_STORAGE_KEY).ok().flatten()) {
        return existing;
    }
    let fresh = format!("user-{}", js_sys::Date::now() as u64);
    if let Some(storage) = storage {
        let _ = storage.set_item(USER_STORAGE_KEY, &fresh);
    }
    fresh
}

fn with_user(builder: RequestBuilder) -> RequestBuilder {
    builder.header(USER_ID_HEADER, &current_user())
}

async fn error_message(resp: Response) -> String {
    let status = resp.status();
    match resp.json::<ApiError>().await {
        Ok(ApiError { retry_after: Some(secs), .. }) => {
            format!("Too many prompts. Try again in {secs} s.")
        }
        Ok(ApiError { message, .. }) => message,
        Err(_) => format!("Server error: {status}"),
    }
}

/// Fetches the caller's conversations, most recent first.
pub async fn fetch_conversations() -> Result<Vec<Conversation>, String> {
    let resp = with_user(Request::get(&format!("{API_BASE}/api/conversations")))
        .send()
        .await
        .map_err(|e| format!("Network error: {e}"))?;

    if !resp.ok() {
        return Err(error_message(resp).await);
    }

    resp.json::<Vec<Conversation>>()
        .await
        .map_err(|e| format!("Parse error: {e}"))
}

pub async fn create_conversation() -> Result<Conversation, String> {
    let resp = with_user(Request::post(&format!("{API_BASE}/api/conversations")))
        .json(&serde_json::json!({}))
        .map_err(|e| format!("Serialize error: {e}"))?
        .send()
        .await
        .map_err(|e| format!("Network error: {e}"))?;

    if !resp.ok() {
        return Err(error_message(resp).await);
    }

    resp.json::<Conversation>()
        .await
        .map_err(|e| format!("Parse error: {e}"))
}

/// Fetches all messages for a given conversation.
pub async fn fetch_messages(conversation_id: &str) -> Result<Vec<Message>, String> {
    let resp = with_user(Request::get(&format!(
        "{API_BASE}/api/conversations/{conversation_id}/messages"
    )))
    .send()
    .await
    .map_err(|e| format!("Network error: {e}"))?;

    if !resp.ok() {
        return Err(error_message(resp).await);
    }

    resp.json::<Vec<Message>>()
        .await
        .map_err(|e| format!("Parse error: {e}"))
}

/// Submits a prompt; the answer is then read from [`stream_url`].
pub async fn submit_prompt(conversation_id: &str, prompt: &str) -> Result<PromptAccepted, String> {
    let body = PromptRequest { prompt: prompt.to_string() };

    let resp = with_user(Request::post(&format!(
        "{API_BASE}/api/conversations/{conversation_id}/prompt"
    )))
    .json(&body)
    .map_err(|e| format!("Serialize error: {e}"))?
    .send()
    .await
    .map_err(|e| format!("Network error: {e}"))?;

    if !resp.ok() {
        return Err(error_message(resp).await);
    }

    resp.json::<PromptAccepted>()
        .await
        .map_err(|e| format!("Parse error: {e}"))
}

pub async fn cancel_message(message_id: &str) -> Result<(), String> {
    let resp = with_user(Request::post(&format!("{API_BASE}/api/messages/{message_id}/cancel")))
        .send()
        .await
        .map_err(|e| format!("Network error: {e}"))?;

    if !resp.ok() {
        return Err(error_message(resp).await);
    }
    Ok(())
}

/// `EventSource` cannot set headers, so the identity goes in the query.
pub fn stream_url(conversation_id: &str, message_id: &str) -> String {
    let user = String::from(js_sys::encode_uri_component(&current_user()));
    format!("{API_BASE}/api/stream/{conversation_id}/{message_id}?user_id={user}")
}
