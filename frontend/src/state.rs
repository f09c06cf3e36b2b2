use leptos::prelude::*;
use leptos::task::spawn_local;

use crate::api;
use crate::models::{Conversation, Message};
use crate::sse::{self, StreamHandle};
use crate::stream::{Action, Phase, StreamConsumer, StreamEvent};

/// Shared application state, provided via Leptos context.
#[derive(Clone, Copy)]
pub struct AppState {
    // --- Read signals (for components to subscribe to) ---
    pub conversations: ReadSignal<Vec<Conversation>>,
    pub active_conversation: ReadSignal<Option<String>>,
    pub messages: ReadSignal<Vec<Message>>,
    /// The assistant stream currently (or last) consumed.
    pub stream: ReadSignal<Option<StreamConsumer>>,
    /// A prompt submission is in flight and no stream is open yet.
    pub submitting: ReadSignal<bool>,
    pub retry_available: ReadSignal<bool>,
    pub error: ReadSignal<Option<String>>,

    // --- Write signals (for mutating state) ---
    pub set_conversations: WriteSignal<Vec<Conversation>>,
    pub set_active_conversation: WriteSignal<Option<String>>,
    pub set_messages: WriteSignal<Vec<Message>>,
    set_stream: WriteSignal<Option<StreamConsumer>>,
    set_submitting: WriteSignal<bool>,
    set_retry_available: WriteSignal<bool>,
    pub set_error: WriteSignal<Option<String>>,

    last_prompt: StoredValue<Option<String>>,
    connection: StoredValue<Option<StreamHandle>, LocalStorage>,
}

impl AppState {
    /// Create a new `AppState` and provide it in the current Leptos context.
    pub fn provide() -> Self {
        let (conversations, set_conversations) = signal(Vec::<Conversation>::new());
        let (active_conversation, set_active_conversation) = signal(None::<String>);
        let (messages, set_messages) = signal(Vec::<Message>::new());
        let (stream, set_stream) = signal(None::<StreamConsumer>);
        let (submitting, set_submitting) = signal(false);
        let (retry_available, set_retry_available) = signal(false);
        let (error, set_error) = signal(None::<String>);

        let state = Self {
            conversations,
            active_conversation,
            messages,
            stream,
            submitting,
            retry_available,
            error,
            set_conversations,
            set_active_conversation,
            set_messages,
            set_stream,
            set_submitting,
            set_retry_available,
            set_error,
            last_prompt: StoredValue::new(None),
            connection: StoredValue::new_local(None),
        };

        provide_context(state);
        state
    }

    /// True while the composer must stay disabled. Tracks reactively.
    pub fn is_sending(&self) -> bool {
        self.submitting.get() || self.stream.with(|s| s.as_ref().is_some_and(StreamConsumer::is_sending))
    }

    fn is_sending_untracked(&self) -> bool {
        self.submitting.get_untracked()
            || self.stream.with_untracked(|s| s.as_ref().is_some_and(StreamConsumer::is_sending))
    }

    pub fn active_title(&self) -> String {
        let active = self.active_conversation.get();
        self.conversations
            .with(|convos| {
                active
                    .as_deref()
                    .and_then(|id| convos.iter().find(|c| c.id == id))
                    .map(|c| c.title.clone())
            })
            .unwrap_or_else(|| "New conversation".to_string())
    }

    /// Load conversations from the backend.
    pub fn load_conversations(&self) {
        let state = *self;
        spawn_local(async move {
            match api::fetch_conversations().await {
                Ok(convos) => state.set_conversations.set(convos),
                Err(e) => {
                    log::error!("Failed to fetch conversations: {e}");
                    state.set_error.set(Some(e));
                }
            }
        });
    }

    /// Select a conversation and load its messages.
    pub fn select_conversation(&self, id: String) {
        if self.is_sending_untracked() {
            return;
        }
        let state = *self;
        self.close_connection();
        self.set_active_conversation.set(Some(id.clone()));
        self.set_stream.set(None);
        self.set_error.set(None);
        self.set_retry_available.set(false);

        spawn_local(async move {
            match api::fetch_messages(&id).await {
                Ok(msgs) => {
                    let errored = msgs.last().is_some_and(Message::is_errored);
                    state.set_messages.set(msgs);
                    state.set_retry_available.set(errored && state.last_prompt.get_value().is_some());
                }
                Err(e) => {
                    log::error!("Failed to fetch messages: {e}");
                    state.set_error.set(Some(e));
                }
            }
        });
    }

    /// Create an empty conversation and switch to it.
    pub fn new_conversation(&self) {
        if self.is_sending_untracked() {
            return;
        }
        let state = *self;
        spawn_local(async move {
            match api::create_conversation().await {
                Ok(conversation) => {
                    let id = conversation.id.clone();
                    state.set_conversations.update(|convos| convos.insert(0, conversation));
                    state.set_messages.set(Vec::new());
                    state.select_conversation(id);
                }
                Err(e) => {
                    log::error!("Failed to create conversation: {e}");
                    state.set_error.set(Some(e));
                }
            }
        });
    }

    /// Submit a prompt and stream the answer.
    pub fn send_prompt(&self, text: String) {
        let prompt = text.trim().to_string();
        if prompt.is_empty() || self.is_sending_untracked() {
            return;
        }
        self.last_prompt.set_value(Some(prompt.clone()));
        self.set_submitting.set(true);
        self.set_retry_available.set(false);
        self.set_error.set(None);

        let state = *self;
        spawn_local(async move {
            let result = match state.ensure_conversation().await {
                Ok(conversation_id) => api::submit_prompt(&conversation_id, &prompt).await,
                Err(e) => Err(e),
            };
            state.set_submitting.set(false);

            match result {
                Ok(accepted) => {
                    // A resubmission within the dedup window returns the same ids.
                    state.set_messages.update(|msgs| {
                        if !msgs.iter().any(|m| m.id == accepted.user_message_id) {
                            msgs.push(Message::user(accepted.user_message_id.clone(), prompt.clone()));
                        }
                        if !msgs.iter().any(|m| m.id == accepted.assistant_message_id) {
                            msgs.push(Message::assistant_placeholder(accepted.assistant_message_id.clone()));
                        }
                    });
                    state.start_stream(&accepted.conversation_id, accepted.assistant_message_id);
                }
                Err(e) => {
                    log::error!("Prompt rejected: {e}");
                    state.set_error.set(Some(e));
                    state.set_retry_available.set(true);
                }
            }
        });
    }

    async fn ensure_conversation(&self) -> Result<String, String> {
        if let Some(id) = self.active_conversation.get_untracked() {
            return Ok(id);
        }
        let conversation = api::create_conversation().await?;
        let id = conversation.id.clone();
        self.set_conversations.update(|convos| convos.insert(0, conversation));
        self.set_active_conversation.set(Some(id.clone()));
        Ok(id)
    }

    pub fn retry_last_prompt(&self) {
        if let Some(prompt) = self.last_prompt.get_value() {
            self.send_prompt(prompt);
        }
    }

    /// Ask the server to stop the current generation. The bubble is marked
    /// cancelled right away; the server's own events are no longer read.
    pub fn cancel_stream(&self) {
        let Some(message_id) = self.stream.with_untracked(|s| {
            s.as_ref().filter(|c| c.is_sending()).map(|c| c.message_id.clone())
        }) else {
            return;
        };

        spawn_local(async move {
            if let Err(e) = api::cancel_message(&message_id).await {
                log::warn!("Cancel request failed: {e}");
            }
        });

        let mut action = Action::Nothing;
        self.set_stream.update(|s| {
            if let Some(consumer) = s {
                action = consumer.cancel();
            }
        });
        self.after_stream_update(action);
    }

    fn start_stream(&self, conversation_id: &str, message_id: String) {
        self.close_connection();
        self.set_stream.set(Some(StreamConsumer::begin(message_id.clone())));

        let state = *self;
        let url = api::stream_url(conversation_id, &message_id);
        match sse::open(&url, move |event| state.apply_stream_event(event)) {
            Ok(handle) => self.connection.set_value(Some(handle)),
            Err(e) => {
                log::error!("{e}");
                self.apply_stream_event(StreamEvent::Disconnected);
            }
        }
    }

    fn apply_stream_event(&self, event: StreamEvent) {
        let mut action = Action::Nothing;
        self.set_stream.update(|s| {
            if let Some(consumer) = s {
                action = consumer.apply(event);
            }
        });
        self.after_stream_update(action);
    }

    fn after_stream_update(&self, action: Action) {
        if action == Action::Nothing {
            return;
        }
        let Some(consumer) = self.stream.get_untracked() else {
            return;
        };

        // Re-render the bubble from the full accumulated text.
        self.set_messages.update(|msgs| {
            if let Some(m) = msgs.iter_mut().find(|m| m.id == consumer.message_id) {
                m.content = Some(consumer.raw.clone());
                m.source_documents = consumer.sources.clone();
                m.status = consumer.status().to_string();
                m.error = consumer.error().map(str::to_string);
            }
        });

        if action == Action::Close {
            self.close_connection();
            self.set_retry_available.set(consumer.retry_available());
            if consumer.phase == Phase::Completed {
                // The first answer may have renamed the conversation.
                self.load_conversations();
            }
        }
    }

    fn close_connection(&self) {
        let mut taken = None;
        self.connection.update_value(|handle| taken = handle.take());
        if let Some(handle) = taken {
            handle.close();
            // Listeners may be running right now; release them afterwards.
            spawn_local(async move { drop(handle) });
        }
    }
}
