use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Matches the backend `Conversation` model.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub last_activity_at: String,
    pub created_at: String,
}

/// Matches the backend `MessageView`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub source_documents: Vec<Value>,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub created_at: String,
}

fn default_format() -> String {
    "markdown".to_string()
}

impl Message {
    /// Local echo of a prompt the server accepted.
    pub fn user(id: String, content: String) -> Self {
        Self {
            id,
            role: "user".to_string(),
            content: Some(content),
            status: "completed".to_string(),
            error: None,
            source_documents: Vec::new(),
            format: default_format(),
            created_at: String::new(),
        }
    }

    /// The assistant bubble a stream fills in.
    pub fn assistant_placeholder(id: String) -> Self {
        Self {
            id,
            role: "assistant".to_string(),
            content: None,
            status: "streaming".to_string(),
            error: None,
            source_documents: Vec::new(),
            format: default_format(),
            created_at: String::new(),
        }
    }

    pub fn is_errored(&self) -> bool {
        self.status == "error"
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PromptRequest {
    pub prompt: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptAccepted {
    pub conversation_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
}

/// Error body returned by every endpoint; `retryAfter` only on 429.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub message: String,
    #[serde(default)]
    pub retry_after: Option<u64>,
}
