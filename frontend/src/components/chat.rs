use leptos::ev;
use leptos::html;
use leptos::prelude::*;

use crate::markdown;
use crate::models::Message;
use crate::state::AppState;
use crate::stream::citation_label;

/// Main chat area with message history, streaming display, and input.
#[component]
pub fn ChatArea() -> impl IntoView {
    let state = expect_context::<AppState>();
    let thread = NodeRef::<html::Div>::new();

    // Keep the newest content in view while tokens arrive.
    Effect::new(move |_| {
        state.messages.track();
        if let Some(el) = thread.get() {
            el.set_scroll_top(el.scroll_height());
        }
    });

    view! {
        <main class="chat-area">
            // Error banner
            {move || {
                state.error.get().map(|err| {
                    view! {
                        <div class="error-banner">{err}</div>
                    }
                })
            }}

            <div class="chat-header">{move || state.active_title()}</div>

            // Messages
            <div class="messages-container" node_ref=thread>
                {move || {
                    let msgs = state.messages.get();
                    if msgs.is_empty() {
                        view! {
                            <div class="empty-state">
                                "Ask a question about your documents to start"
                            </div>
                        }.into_any()
                    } else {
                        msgs.into_iter()
                            .map(|message| view! { <MessageBubble message=message /> })
                            .collect_view()
                            .into_any()
                    }
                }}
            </div>

            <ChatInput />
        </main>
    }
}

/// A single chat message bubble, rendered from its full raw content.
#[component]
fn MessageBubble(message: Message) -> impl IntoView {
    let state = expect_context::<AppState>();
    let css_class = if message.role == "user" {
        "message user"
    } else {
        "message assistant"
    };
    let errored = message.is_errored();
    let streaming = message.status == "streaming";
    let html = markdown::render(message.content.as_deref().unwrap_or_default());
    let sources: Vec<String> = message
        .source_documents
        .iter()
        .enumerate()
        .map(|(i, source)| citation_label(source, i))
        .collect();

    view! {
        <div class=css_class class:errored=errored>
            <div class="role-label">{message.role.clone()}</div>
            <div class="message-content" inner_html=html></div>
            {streaming.then(|| view! { <span class="streaming-cursor"></span> })}
            {(!sources.is_empty()).then(|| view! {
                <div class="sources">
                    <span class="sources-title">"Sources"</span>
                    {sources.into_iter()
                        .map(|label| view! { <span class="source-badge">{label}</span> })
                        .collect_view()}
                </div>
            })}
            {message.error.clone().filter(|_| errored).map(|err| view! {
                <div class="message-error">
                    <span>{err}</span>
                    <button
                        class="retry-btn"
                        on:click=move |_| state.retry_last_prompt()
                        disabled=move || !state.retry_available.get()
                    >
                        "Retry"
                    </button>
                </div>
            })}
        </div>
    }
}

/// Composer with send, cancel and retry actions and a token counter.
#[component]
fn ChatInput() -> impl IntoView {
    let state = expect_context::<AppState>();
    let (input, set_input) = signal(String::new());

    let is_sending = move || state.is_sending();
    let token_count = move || {
        state
            .stream
            .with(|s| s.as_ref().filter(|c| c.is_sending()).map_or(0, |c| c.token_count))
    };

    let send = move || {
        let text = input.get().trim().to_string();
        if text.is_empty() || is_sending() {
            return;
        }
        set_input.set(String::new());
        state.send_prompt(text);
    };

    let on_keydown = move |ev: ev::KeyboardEvent| {
        if ev.key() == "Enter" && !ev.shift_key() {
            ev.prevent_default();
            send();
        }
    };

    view! {
        <div class="input-area">
            <div class="input-row">
                <textarea
                    rows="1"
                    placeholder="Ask a question… (Enter to send, Shift+Enter for newline)"
                    prop:value=input
                    on:input=move |ev| {
                        set_input.set(event_target_value(&ev));
                    }
                    on:keydown=on_keydown
                    readonly=is_sending
                />
                <button
                    class="send-btn"
                    on:click=move |_| send()
                    disabled=move || is_sending() || input.get().trim().is_empty()
                >
                    {move || if is_sending() { "Sending…" } else { "Send" }}
                </button>
                <Show when=is_sending>
                    <button class="cancel-btn" on:click=move |_| state.cancel_stream()>
                        "Cancel"
                    </button>
                </Show>
                <Show when=move || !is_sending() && state.retry_available.get()>
                    <button class="retry-btn" on:click=move |_| state.retry_last_prompt()>
                        "Retry"
                    </button>
                </Show>
            </div>
            <div class="stream-status">
                <Show when=is_sending>
                    <span class="token-count">{token_count}" tokens"</span>
                </Show>
            </div>
        </div>
    }
}
