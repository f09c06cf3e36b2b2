use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::errors::AppError;
use crate::models::StreamEvent;
use crate::routes::identity::CurrentUser;
use crate::service::chat_service::ChatService;

const EVENT_BUFFER: usize = 64;
const KEEP_ALIVE_SECS: u64 = 15;

/// GET `/api/stream/{conversation_id}/{message_id}`: server-sent events for
/// one assistant message: `token`*, `sources`?, `error`?, then one `done`.
///
/// Generation runs on its own task, so it finishes and persists even if the
/// client goes away mid-stream.
pub async fn stream_message_handler(
    State(svc): State<ChatService>,
    CurrentUser(user_id): CurrentUser,
    Path((conversation_id, message_id)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let conversation = svc.get_conversation(&conversation_id, &user_id).await?;
    let message = svc.find_assistant_message(&conversation, &message_id).await?;

    let (tx, rx) = mpsc::channel::<StreamEvent>(EVENT_BUFFER);
    tokio::spawn(async move {
        svc.stream_assistant_message(&conversation, &message, &user_id, tx).await;
        debug!("Stream task for message {} finished", message.id);
    });

    let events = ReceiverStream::new(rx).map(|event| Ok(to_sse_event(event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(KEEP_ALIVE_SECS))))
}

pub fn to_sse_event(event: StreamEvent) -> Event {
    let name = event.name();
    let data = match event {
        // SSE fields cannot carry carriage returns.
        StreamEvent::Token { text } => text.replace("\r\n", "\n").replace('\r', "\n"),
        StreamEvent::Sources { sources } => {
            serde_json::to_string(&sources).unwrap_or_else(|_| "[]".to_string())
        }
        StreamEvent::Error { message } => serde_json::json!({ "message": message }).to_string(),
        StreamEvent::Done => "end".to_string(),
    };
    Event::default().event(name).data(data)
}
