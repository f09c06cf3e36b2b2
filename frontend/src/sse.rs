use std::rc::Rc;

use serde_json::Value;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{Event, EventSource, MessageEvent};

use crate::models::ApiError;
use crate::stream::StreamEvent;

const EVENT_NAMES: [&str; 4] = ["token", "sources", "error", "done"];
const GENERIC_ERROR: &str = "The assistant could not answer.";

/// An open `EventSource` and the listeners attached to it. Dropping the
/// handle closes the connection; there is no automatic reconnect.
pub struct StreamHandle {
    source: EventSource,
    _listeners: Vec<Closure<dyn Fn(Event)>>,
}

impl StreamHandle {
    pub fn close(&self) {
        self.source.close();
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.source.close();
    }
}

/// Opens the stream at `url` and forwards each named event to `on_event`.
pub fn open(url: &str, on_event: impl Fn(StreamEvent) + 'static) -> Result<StreamHandle, String> {
    let source = EventSource::new(url).map_err(|e| format!("Failed to open stream: {e:?}"))?;
    let on_event: Rc<dyn Fn(StreamEvent)> = Rc::new(on_event);

    let mut listeners = Vec::with_capacity(EVENT_NAMES.len());
    for name in EVENT_NAMES {
        let on_event = on_event.clone();
        let listener = Closure::<dyn Fn(Event)>::new(move |ev: Event| on_event(decode(name, &ev)));
        source
            .add_event_listener_with_callback(name, listener.as_ref().unchecked_ref())
            .map_err(|e| format!("Failed to listen for {name}: {e:?}"))?;
        listeners.push(listener);
    }

    Ok(StreamHandle { source, _listeners: listeners })
}

fn decode(name: &str, ev: &Event) -> StreamEvent {
    // Transport failures arrive as a plain `error` Event without data.
    let data = ev.dyn_ref::<MessageEvent>().and_then(|m| m.data().as_string());
    match (name, data) {
        ("token", data) => StreamEvent::Token(data.unwrap_or_default()),
        ("sources", data) => StreamEvent::Sources(
            data.and_then(|d| serde_json::from_str::<Vec<Value>>(&d).ok()).unwrap_or_default(),
        ),
        ("error", Some(data)) => {
            let message = serde_json::from_str::<ApiError>(&data)
                .map(|e| e.message)
                .unwrap_or_else(|_| GENERIC_ERROR.to_string());
            StreamEvent::Error(message)
        }
        ("error", None) => {
            log::warn!("Stream connection error");
            StreamEvent::Disconnected
        }
        _ => StreamEvent::Done,
    }
}
