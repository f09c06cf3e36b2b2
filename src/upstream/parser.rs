//! Incremental decoder for the generation backend's response body.
//!
//! The backend emits newline-delimited JSON objects such as
//! `{"response": "..."}` or `{"references": [...]}`, sometimes wrapped in
//! SSE `data:` framing. Network chunks do not line up with records, so bytes
//! are buffered until a line terminator arrives. A record that fails to
//! decode becomes a token carrying the raw line; one bad record never aborts
//! the stream.

use serde_json::{Map, Value};
use tracing::debug;

/// A typed event decoded from one upstream record.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Token(String),
    Sources(Vec<Value>),
    Error(String),
}

/// Decodes every complete line in `buffer`.
///
/// Returns the events and the unconsumed remainder. With `force_flush` the
/// trailing unterminated line is decoded as well and the remainder is empty.
pub fn parse_events(buffer: &[u8], force_flush: bool) -> (Vec<UpstreamEvent>, Vec<u8>) {
    let mut events = Vec::new();
    let mut start = 0;

    while let Some(offset) = buffer[start..].iter().position(|b| *b == b'\n') {
        decode_line(&buffer[start..start + offset], &mut events);
        start += offset + 1;
    }

    if force_flush {
        decode_line(&buffer[start..], &mut events);
        return (events, Vec::new());
    }
    (events, buffer[start..].to_vec())
}

fn decode_line(raw: &[u8], events: &mut Vec<UpstreamEvent>) {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim();
    if line.is_empty() {
        return;
    }

    let payload = match line.strip_prefix("data:") {
        Some(data) => {
            let data = data.trim_start();
            if data.is_empty() || data == "[DONE]" {
                return;
            }
            data
        }
        None => line,
    };

    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(object)) => decode_object(object, payload, events),
        Ok(_) | Err(_) => {
            debug!("Upstream line is not a JSON object, relaying it as text");
            events.push(UpstreamEvent::Token(payload.to_string()));
        }
    }
}

fn decode_object(mut object: Map<String, Value>, raw: &str, events: &mut Vec<UpstreamEvent>) {
    let references = object.remove("references");
    let response = object.remove("response");

    if let Some(references) = &references {
        let sources = match references {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        };
        events.push(UpstreamEvent::Sources(sources));
    }

    if let Some(response) = &response {
        let text = match response {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        events.push(UpstreamEvent::Token(text));
    }

    if references.is_none() && response.is_none() {
        match object.remove("error") {
            Some(error) => events.push(UpstreamEvent::Error(error_text(&error))),
            None => events.push(UpstreamEvent::Token(raw.to_string())),
        }
    }
}

fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(o) => o
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Stateful wrapper around [`parse_events`] that owns the remainder buffer.
#[derive(Debug, Default)]
pub struct UpstreamEventParser {
    buffer: Vec<u8>,
}

impl UpstreamEventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a network chunk and returns the events of every completed line.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<UpstreamEvent> {
        self.buffer.extend_from_slice(chunk);
        if !chunk.contains(&b'\n') {
            return Vec::new();
        }
        let (events, rest) = parse_events(&self.buffer, false);
        self.buffer = rest;
        events
    }

    /// Force-flushes whatever is still buffered when the stream ends.
    pub fn finish(&mut self) -> Vec<UpstreamEvent> {
        let (events, _) = parse_events(&std::mem::take(&mut self.buffer), true);
        events
    }

    #[cfg(test)]
    fn remainder(&self) -> &[u8] {
        &self.buffer
    }
}
