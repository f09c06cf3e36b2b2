//! Client-side state of one assistant stream.
//!
//! Kept free of DOM types so the transitions can be unit tested natively.
//! The accumulated raw text is canonical: the bubble is always re-rendered
//! from it, never patched with incremental fragments.

use serde_json::Value;

/// A decoded server-sent event, or the loss of the connection.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Token(String),
    Sources(Vec<Value>),
    Error(String),
    Done,
    /// The transport failed. Never retried automatically: the server-side
    /// generation cannot be resumed mid-stream.
    Disconnected,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Phase {
    Streaming,
    Completed,
    Errored(String),
}

/// What the caller must do after applying an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Nothing,
    Render,
    /// Re-render and close the connection.
    Close,
}

pub const CONNECTION_LOST: &str = "Connection lost before the answer finished.";
pub const CANCELLED: &str = "Generation cancelled.";

#[derive(Clone, Debug, PartialEq)]
pub struct StreamConsumer {
    pub message_id: String,
    pub raw: String,
    pub token_count: usize,
    pub sources: Vec<Value>,
    pub phase: Phase,
}

impl StreamConsumer {
    pub fn begin(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            raw: String::new(),
            token_count: 0,
            sources: Vec::new(),
            phase: Phase::Streaming,
        }
    }

    /// The composer stays disabled while this is true.
    pub fn is_sending(&self) -> bool {
        self.phase == Phase::Streaming
    }

    pub fn retry_available(&self) -> bool {
        matches!(self.phase, Phase::Errored(_))
    }

    pub fn error(&self) -> Option<&str> {
        match &self.phase {
            Phase::Errored(message) => Some(message),
            _ => None,
        }
    }

    pub fn apply(&mut self, event: StreamEvent) -> Action {
        if self.phase != Phase::Streaming {
            // The server closes the connection after `done`; the browser then
            // reports an error that must not clobber the final state.
            return if self.retry_available() && event == StreamEvent::Done {
                Action::Close
            } else {
                Action::Nothing
            };
        }
        match event {
            StreamEvent::Token(text) => {
                self.raw.push_str(&text);
                self.token_count += 1;
                Action::Render
            }
            StreamEvent::Sources(sources) => {
                self.sources = sources;
                Action::Render
            }
            StreamEvent::Error(message) => {
                self.phase = Phase::Errored(message);
                Action::Close
            }
            StreamEvent::Done => {
                self.phase = Phase::Completed;
                Action::Close
            }
            StreamEvent::Disconnected => {
                self.phase = Phase::Errored(CONNECTION_LOST.to_string());
                Action::Close
            }
        }
    }

    /// Local cancel: the request is sent, the bubble is failed right away.
    pub fn cancel(&mut self) -> Action {
        if self.phase != Phase::Streaming {
            return Action::Nothing;
        }
        self.phase = Phase::Errored(CANCELLED.to_string());
        Action::Close
    }

    pub fn status(&self) -> &'static str {
        match self.phase {
            Phase::Streaming => "streaming",
            Phase::Completed => "completed",
            Phase::Errored(_) => "error",
        }
    }
}

/// Display label of a citation descriptor.
pub fn citation_label(source: &Value, index: usize) -> String {
    let label = match source {
        Value::String(s) => Some(s.clone()),
        Value::Object(object) => ["title", "path", "file_path", "url"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    };
    label
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| format!("Source {}", index + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tokens_accumulate_and_count() {
        let mut consumer = StreamConsumer::begin("m1");
        assert!(consumer.is_sending());
        assert_eq!(consumer.apply(StreamEvent::Token("Hi".into())), Action::Render);
        assert_eq!(consumer.apply(StreamEvent::Token(" there".into())), Action::Render);
        assert_eq!(consumer.raw, "Hi there");
        assert_eq!(consumer.token_count, 2);
    }

    #[test]
    fn sources_replace_previous_block() {
        let mut consumer = StreamConsumer::begin("m1");
        consumer.apply(StreamEvent::Sources(vec![json!("a.md")]));
        consumer.apply(StreamEvent::Sources(vec![json!("doc.md")]));
        assert_eq!(consumer.sources, vec![json!("doc.md")]);
    }

    #[test]
    fn done_closes_and_reenables_composer() {
        let mut consumer = StreamConsumer::begin("m1");
        consumer.apply(StreamEvent::Token("Hi".into()));
        assert_eq!(consumer.apply(StreamEvent::Done), Action::Close);
        assert!(!consumer.is_sending());
        assert!(!consumer.retry_available());
        // Browser error fired by the server closing the connection.
        assert_eq!(consumer.apply(StreamEvent::Disconnected), Action::Nothing);
        assert_eq!(consumer.phase, Phase::Completed);
    }

    #[test]
    fn error_event_offers_retry() {
        let mut consumer = StreamConsumer::begin("m1");
        assert_eq!(consumer.apply(StreamEvent::Error("model overloaded".into())), Action::Close);
        assert!(consumer.retry_available());
        assert!(!consumer.is_sending());
        assert_eq!(consumer.error(), Some("model overloaded"));
        assert_eq!(consumer.apply(StreamEvent::Token("late".into())), Action::Nothing);
        assert_eq!(consumer.raw, "");
    }

    #[test]
    fn disconnect_before_done_is_an_error() {
        let mut consumer = StreamConsumer::begin("m1");
        consumer.apply(StreamEvent::Token("partial".into()));
        assert_eq!(consumer.apply(StreamEvent::Disconnected), Action::Close);
        assert_eq!(consumer.status(), "error");
        assert_eq!(consumer.error(), Some(CONNECTION_LOST));
        assert!(consumer.retry_available());
    }

    #[test]
    fn cancel_only_applies_while_streaming() {
        let mut consumer = StreamConsumer::begin("m1");
        assert_eq!(consumer.cancel(), Action::Close);
        assert_eq!(consumer.error(), Some(CANCELLED));
        assert_eq!(consumer.cancel(), Action::Nothing);
    }

    #[test]
    fn citation_labels() {
        assert_eq!(citation_label(&json!("doc.md"), 0), "doc.md");
        assert_eq!(citation_label(&json!({"title": "Guide", "url": "https://x"}), 0), "Guide");
        assert_eq!(citation_label(&json!({"file_path": "a/b.md"}), 1), "a/b.md");
        assert_eq!(citation_label(&json!({"score": 0.4}), 2), "Source 3");
    }
}
