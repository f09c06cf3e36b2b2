use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_CONVERSATION_TITLE: &str = "New conversation";
pub const CANCELLED_BY_USER: &str = "cancelled by user";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn new(user_id: String, title: Option<String>) -> Self {
        let now = Utc::now();
        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_CONVERSATION_TITLE.to_string());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            title,
            last_activity_at: now,
            created_at: now,
            deleted_at: None,
        }
    }

    /// True while the title was never chosen by the user nor derived from a prompt.
    pub fn has_default_title(&self) -> bool {
        let title = self.title.trim();
        title.is_empty() || title == DEFAULT_CONVERSATION_TITLE
    }
}

/// Derives a conversation title from the first prompt: whitespace collapsed, at most 120 chars.
pub fn title_from_prompt(prompt: &str) -> String {
    let collapsed = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return DEFAULT_CONVERSATION_TITLE.to_string();
    }
    collapsed.chars().take(120).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for MessageRole {
    type Error = String;
    fn try_from(s: String) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

/// Lifecycle of a message. Only `Streaming` may transition, and only forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Streaming,
    Completed,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Streaming => "streaming",
            MessageStatus::Completed => "completed",
            MessageStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageStatus::Streaming)
    }
}

impl TryFrom<String> for MessageStatus {
    type Error = String;
    fn try_from(s: String) -> Result<Self, String> {
        match s.as_str() {
            "streaming" => Ok(MessageStatus::Streaming),
            "completed" => Ok(MessageStatus::Completed),
            "error" => Ok(MessageStatus::Error),
            other => Err(format!("Unknown message status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: Option<String>,
    /// Citation descriptors exactly as the generation backend sent them.
    pub source_documents: Vec<Value>,
    pub status: MessageStatus,
    pub error_message: Option<String>,
    pub streamed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    /// A submitted prompt; user messages are born terminal.
    pub fn user(conversation_id: String, content: String, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id,
            role: MessageRole::User,
            content: Some(content),
            source_documents: Vec::new(),
            status: MessageStatus::Completed,
            error_message: None,
            streamed_at: None,
            finished_at: Some(now),
            created_at: now,
        }
    }

    /// The empty reply record that a stream will fill in.
    pub fn assistant_placeholder(conversation_id: String, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id,
            role: MessageRole::Assistant,
            content: None,
            source_documents: Vec::new(),
            status: MessageStatus::Streaming,
            error_message: None,
            streamed_at: None,
            finished_at: None,
            created_at: now,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == MessageStatus::Error && self.error_message.as_deref() == Some(CANCELLED_BY_USER)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Success,
    Error,
    Cancelled,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Success => "success",
            GenerationStatus::Error => "error",
            GenerationStatus::Cancelled => "cancelled",
        }
    }
}

/// One record per generation attempt, kept for operators only.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequestLog {
    pub id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub user_id: String,
    pub duration_ms: i64,
    pub status: GenerationStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GenerationRequestLog {
    pub fn open(conversation_id: &str, message_id: &str, user_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            user_id: user_id.to_string(),
            duration_ms: 0,
            status: GenerationStatus::Success,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

/// A history turn as sent to the generation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: Option<String>,
}

/// The two records created for an accepted prompt.
#[derive(Debug, Clone)]
pub struct PromptPair {
    pub user_message: ConversationMessage,
    pub assistant_message: ConversationMessage,
    /// True when an identical recent submission was found and returned instead.
    pub deduplicated: bool,
}

/// Events relayed to the client over the push stream, in upstream order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Token { text: String },
    Sources { sources: Vec<Value> },
    Error { message: String },
    Done,
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Token { .. } => "token",
            StreamEvent::Sources { .. } => "sources",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done => "done",
        }
    }
}

// ── API payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PromptRequest {
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptAccepted {
    pub conversation_id: String,
    pub user_message_id: String,
    pub assistant_message_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameConversationRequest {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusMessage {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitedResponse {
    pub message: String,
    pub retry_after: u64,
}

/// Wire shape of a message in the conversation listing.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: String,
    pub role: MessageRole,
    pub content: Option<String>,
    pub status: MessageStatus,
    pub error: Option<String>,
    pub source_documents: Vec<Value>,
    pub format: String,
    pub created_at: DateTime<Utc>,
    pub streamed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<ConversationMessage> for MessageView {
    fn from(m: ConversationMessage) -> Self {
        Self {
            id: m.id,
            role: m.role,
            content: m.content,
            status: m.status,
            error: m.error_message,
            source_documents: m.source_documents,
            format: "markdown".to_string(),
            created_at: m.created_at,
            streamed_at: m.streamed_at,
            finished_at: m.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_collapses_whitespace_and_truncates() {
        assert_eq!(title_from_prompt("  Hello \n\t world  "), "Hello world");
        let long = "a".repeat(300);
        assert_eq!(title_from_prompt(&long).chars().count(), 120);
        assert_eq!(title_from_prompt("   "), DEFAULT_CONVERSATION_TITLE);
    }

    #[test]
    fn blank_title_falls_back_to_default() {
        let conv = Conversation::new("u1".into(), Some("   ".into()));
        assert!(conv.has_default_title());
        let named = Conversation::new("u1".into(), Some("Release notes".into()));
        assert!(!named.has_default_title());
    }

    #[test]
    fn roles_and_statuses_use_lowercase_wire_names() {
        assert_eq!(serde_json::to_value(MessageRole::Assistant).unwrap(), "assistant");
        assert_eq!(serde_json::to_value(MessageStatus::Streaming).unwrap(), "streaming");
        assert_eq!(MessageStatus::try_from("error".to_string()).unwrap(), MessageStatus::Error);
        assert!(MessageRole::try_from("robot".to_string()).is_err());
    }
}
