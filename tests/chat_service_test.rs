mod common;

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use common::{done_count, drain, harness, harness_with, test_config, ChannelBackend, ScriptedBackend, Step, USER};
use rag_chat::config::RateLimitConfig;
use rag_chat::db::ChatRepository;
use rag_chat::errors::AppError;
use rag_chat::models::{GenerationStatus, MessageStatus, StreamEvent, CANCELLED_BY_USER};
use serde_json::json;
use tokio::sync::mpsc;

const HELLO_BODY: &[&str] = &[
    "{\"references\": [\"doc.md\"]}\n{\"resp",
    "onse\": \"Hi \"}\n",
    "{\"response\": \"there\"}",
];

#[tokio::test]
async fn test_prompt_streams_tokens_sources_and_completes() -> Result<()> {
    let backend = ScriptedBackend::chunks(HELLO_BODY);
    let h = harness(backend.clone());
    let conversation = h.service.create_conversation(USER, None).await?;

    let pair = h.service.submit_prompt(&conversation, USER, "Hello").await?;
    assert!(!pair.deduplicated);
    assert_eq!(pair.assistant_message.status, MessageStatus::Streaming);
    assert_eq!(h.repo.conversation(&conversation.id).await.unwrap().title, "Hello");

    let (tx, mut rx) = mpsc::channel(64);
    h.service.stream_assistant_message(&conversation, &pair.assistant_message, USER, tx).await;
    let events = drain(&mut rx);

    assert_eq!(
        events,
        vec![
            StreamEvent::Sources { sources: vec![json!("doc.md")] },
            StreamEvent::Token { text: "Hi ".into() },
            StreamEvent::Token { text: "there".into() },
            StreamEvent::Done,
        ]
    );

    let stored = h.repo.find_message(&pair.assistant_message.id).await?.unwrap();
    assert_eq!(stored.status, MessageStatus::Completed);
    assert_eq!(stored.content.as_deref(), Some("Hi there"));
    assert_eq!(stored.source_documents, vec![json!("doc.md")]);
    assert!(stored.streamed_at.is_some());
    assert!(stored.finished_at.is_some());

    let logs = h.repo.request_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, GenerationStatus::Success);
    assert_eq!(logs[0].message_id, pair.assistant_message.id);
    assert_eq!(backend.queries()[0].prompt, "Hello");
    Ok(())
}

#[tokio::test]
async fn test_history_excludes_placeholder_and_keeps_order() -> Result<()> {
    let backend = ScriptedBackend::chunks(&["{\"response\": \"Hi there\"}\n"]);
    let h = harness(backend.clone());
    let conversation = h.service.create_conversation(USER, None).await?;

    let first = h.service.submit_prompt(&conversation, USER, "Hello").await?;
    let (tx, _rx) = mpsc::channel(64);
    h.service.stream_assistant_message(&conversation, &first.assistant_message, USER, tx).await;

    let conversation = h.service.get_conversation(&conversation.id, USER).await?;
    let second = h.service.submit_prompt(&conversation, USER, "And then?").await?;
    let (tx, _rx) = mpsc::channel(64);
    h.service.stream_assistant_message(&conversation, &second.assistant_message, USER, tx).await;

    let query = &backend.queries()[1];
    assert_eq!(query.prompt, "And then?");
    let turns: Vec<(&str, Option<&str>)> =
        query.history.iter().map(|e| (e.role.as_str(), e.content.as_deref())).collect();
    assert_eq!(
        turns,
        vec![("user", Some("Hello")), ("assistant", Some("Hi there")), ("user", Some("And then?"))]
    );
    // The first prompt named the conversation; the second leaves it alone.
    assert_eq!(h.repo.conversation(&conversation.id).await.unwrap().title, "Hello");
    Ok(())
}

#[tokio::test]
async fn test_duplicate_prompt_returns_existing_pair() -> Result<()> {
    let h = harness(ScriptedBackend::chunks(&[]));
    let conversation = h.service.create_conversation(USER, None).await?;

    let first = h.service.submit_prompt(&conversation, USER, "Same question").await?;
    let second = h.service.submit_prompt(&conversation, USER, "  Same question ").await?;

    assert!(second.deduplicated);
    assert_eq!(first.user_message.id, second.user_message.id);
    assert_eq!(first.assistant_message.id, second.assistant_message.id);
    assert_eq!(h.repo.list_messages(&conversation.id).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_prompt_after_another_prompt_keeps_its_own_reply() -> Result<()> {
    let h = harness(ScriptedBackend::chunks(&[]));
    let conversation = h.service.create_conversation(USER, None).await?;

    let first_a = h.service.submit_prompt(&conversation, USER, "A").await?;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let b = h.service.submit_prompt(&conversation, USER, "B").await?;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second_a = h.service.submit_prompt(&conversation, USER, "A").await?;

    assert!(second_a.deduplicated);
    assert_eq!(second_a.user_message.id, first_a.user_message.id);
    assert_eq!(second_a.assistant_message.id, first_a.assistant_message.id);
    assert_ne!(second_a.assistant_message.id, b.assistant_message.id);
    assert_eq!(h.repo.list_messages(&conversation.id).await?.len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_rejects_empty_and_oversized_prompts() -> Result<()> {
    let h = harness(ScriptedBackend::chunks(&[]));
    let conversation = h.service.create_conversation(USER, None).await?;

    let err = h.service.submit_prompt(&conversation, USER, "   ").await.unwrap_err();
    assert!(err.is_validation());

    let long = "x".repeat(8001);
    let err = h.service.submit_prompt(&conversation, USER, &long).await.unwrap_err();
    assert!(matches!(err, AppError::FieldTooLong { max_length: 8000, .. }));
    assert!(h.repo.list_messages(&conversation.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_rate_limit_rejects_prompt_over_budget() -> Result<()> {
    let mut config = test_config();
    config.rate_limit = RateLimitConfig { max_requests: 2, interval: std::time::Duration::from_secs(60) };
    let h = harness_with(ScriptedBackend::chunks(&[]), config);
    let conversation = h.service.create_conversation(USER, None).await?;

    h.service.submit_prompt(&conversation, USER, "one").await?;
    h.service.submit_prompt(&conversation, USER, "two").await?;
    let err = h.service.submit_prompt(&conversation, USER, "three").await.unwrap_err();

    let retry_after = err.retry_after().expect("rate limit error");
    assert!((1..=60).contains(&retry_after));
    assert_eq!(h.repo.list_messages(&conversation.id).await?.len(), 4);

    // Limits are per user.
    let other = h.service.create_conversation("user-2", None).await?;
    h.service.submit_prompt(&other, "user-2", "one").await?;
    Ok(())
}

#[tokio::test]
async fn test_cancel_before_stream_skips_backend() -> Result<()> {
    let backend = ScriptedBackend::chunks(HELLO_BODY);
    let h = harness(backend.clone());
    let conversation = h.service.create_conversation(USER, None).await?;
    let pair = h.service.submit_prompt(&conversation, USER, "Hello").await?;

    h.service.cancel_assistant_message(&pair.assistant_message).await?;

    let (tx, mut rx) = mpsc::channel(64);
    h.service.stream_assistant_message(&conversation, &pair.assistant_message, USER, tx).await;
    let events = drain(&mut rx);

    assert_eq!(backend.calls(), 0);
    assert_eq!(
        events,
        vec![StreamEvent::Error { message: CANCELLED_BY_USER.into() }, StreamEvent::Done]
    );
    let stored = h.repo.find_message(&pair.assistant_message.id).await?.unwrap();
    assert_eq!(stored.status, MessageStatus::Error);
    assert_eq!(stored.error_message.as_deref(), Some(CANCELLED_BY_USER));

    let logs = h.repo.request_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, GenerationStatus::Cancelled);
    Ok(())
}

#[tokio::test]
async fn test_flag_without_status_change_still_cancels() -> Result<()> {
    let backend = ScriptedBackend::chunks(HELLO_BODY);
    let h = harness(backend.clone());
    let conversation = h.service.create_conversation(USER, None).await?;
    let pair = h.service.submit_prompt(&conversation, USER, "Hello").await?;

    h.service.cancellations().cancel(&pair.assistant_message.id).await?;

    let (tx, mut rx) = mpsc::channel(64);
    h.service.stream_assistant_message(&conversation, &pair.assistant_message, USER, tx).await;
    let events = drain(&mut rx);

    assert_eq!(backend.calls(), 0);
    assert_eq!(done_count(&events), 1);
    let stored = h.repo.find_message(&pair.assistant_message.id).await?.unwrap();
    assert!(stored.is_cancelled());
    Ok(())
}

#[tokio::test]
async fn test_cancel_mid_stream_stops_relay() -> Result<()> {
    let (backend, body) = ChannelBackend::new();
    let h = harness(backend);
    let conversation = h.service.create_conversation(USER, None).await?;
    let pair = h.service.submit_prompt(&conversation, USER, "Hello").await?;

    let (tx, mut rx) = mpsc::channel(64);
    let service = h.service.clone();
    let (conv, msg) = (conversation.clone(), pair.assistant_message.clone());
    let task = tokio::spawn(async move {
        service.stream_assistant_message(&conv, &msg, USER, tx).await;
    });

    body.send(Bytes::from_static(b"{\"response\": \"Hi\"}\n")).await?;
    assert_eq!(rx.recv().await, Some(StreamEvent::Token { text: "Hi".into() }));

    h.service.cancel_assistant_message(&pair.assistant_message).await?;
    // Anything arriving after the cancel must not be relayed.
    let _ = body.send(Bytes::from_static(b"{\"response\": \" more\"}\n")).await;
    drop(body);
    task.await?;

    let rest = drain(&mut rx);
    assert_eq!(rest.last(), Some(&StreamEvent::Done));
    assert_eq!(done_count(&rest), 1);
    assert!(!rest.contains(&StreamEvent::Token { text: " more".into() }));
    assert!(rest.contains(&StreamEvent::Error { message: CANCELLED_BY_USER.into() }));

    let stored = h.repo.find_message(&pair.assistant_message.id).await?.unwrap();
    assert_eq!(stored.status, MessageStatus::Error);
    assert_eq!(stored.error_message.as_deref(), Some(CANCELLED_BY_USER));
    assert_eq!(stored.content.as_deref(), Some("Hi"));

    let logs = h.repo.request_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, GenerationStatus::Cancelled);
    Ok(())
}

#[tokio::test]
async fn test_cancel_is_idempotent_and_keeps_completed_state() -> Result<()> {
    let h = harness(ScriptedBackend::chunks(&["{\"response\": \"done\"}\n"]));
    let conversation = h.service.create_conversation(USER, None).await?;
    let pair = h.service.submit_prompt(&conversation, USER, "Hello").await?;

    let (tx, _rx) = mpsc::channel(64);
    h.service.stream_assistant_message(&conversation, &pair.assistant_message, USER, tx).await;

    h.service.cancel_assistant_message(&pair.assistant_message).await?;
    h.service.cancel_assistant_message(&pair.assistant_message).await?;

    let stored = h.repo.find_message(&pair.assistant_message.id).await?.unwrap();
    assert_eq!(stored.status, MessageStatus::Completed);
    assert_eq!(stored.error_message, None);

    let err = h.service.cancel_assistant_message(&pair.user_message).await.unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[tokio::test]
async fn test_upstream_error_event_ends_stream() -> Result<()> {
    let h = harness(ScriptedBackend::chunks(&[
        "{\"response\": \"partial\"}\n",
        "{\"error\": {\"message\": \"model overloaded\"}}\n{\"response\": \"ignored\"}\n",
    ]));
    let conversation = h.service.create_conversation(USER, None).await?;
    let pair = h.service.submit_prompt(&conversation, USER, "Hello").await?;

    let (tx, mut rx) = mpsc::channel(64);
    h.service.stream_assistant_message(&conversation, &pair.assistant_message, USER, tx).await;
    let events = drain(&mut rx);

    assert_eq!(
        events,
        vec![
            StreamEvent::Token { text: "partial".into() },
            StreamEvent::Error { message: "model overloaded".into() },
            StreamEvent::Done,
        ]
    );
    let stored = h.repo.find_message(&pair.assistant_message.id).await?.unwrap();
    assert_eq!(stored.status, MessageStatus::Error);
    assert_eq!(stored.error_message.as_deref(), Some("model overloaded"));
    assert_eq!(stored.content.as_deref(), Some("partial"));
    assert_eq!(h.repo.request_logs().await[0].status, GenerationStatus::Error);
    Ok(())
}

#[tokio::test]
async fn test_cancel_settled_before_upstream_error_is_logged_as_cancelled() -> Result<()> {
    let (backend, body) = ChannelBackend::new();
    let h = harness(backend);
    let conversation = h.service.create_conversation(USER, None).await?;
    let pair = h.service.submit_prompt(&conversation, USER, "Hello").await?;

    let (tx, mut rx) = mpsc::channel(64);
    let service = h.service.clone();
    let (conv, msg) = (conversation.clone(), pair.assistant_message.clone());
    let task = tokio::spawn(async move {
        service.stream_assistant_message(&conv, &msg, USER, tx).await;
    });

    body.send(Bytes::from_static(b"{\"response\": \"Hi\"}\n")).await?;
    assert_eq!(rx.recv().await, Some(StreamEvent::Token { text: "Hi".into() }));

    // The cancel has settled the row but its flag is not raised yet.
    h.repo
        .finish_message(&pair.assistant_message.id, MessageStatus::Error, Some(CANCELLED_BY_USER), chrono::Utc::now())
        .await?;
    body.send(Bytes::from_static(b"{\"error\": \"model overloaded\"}\n")).await?;
    drop(body);
    task.await?;

    let rest = drain(&mut rx);
    assert_eq!(
        rest,
        vec![StreamEvent::Error { message: CANCELLED_BY_USER.into() }, StreamEvent::Done]
    );
    let stored = h.repo.find_message(&pair.assistant_message.id).await?.unwrap();
    assert_eq!(stored.error_message.as_deref(), Some(CANCELLED_BY_USER));

    let logs = h.repo.request_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, GenerationStatus::Cancelled);
    assert_eq!(logs[0].error_message.as_deref(), Some(CANCELLED_BY_USER));
    Ok(())
}

#[tokio::test]
async fn test_transport_failure_marks_message_errored() -> Result<()> {
    let h = harness(ScriptedBackend::new(vec![
        Step::Chunk("{\"response\": \"Hi\"}\n"),
        Step::Fail("connection reset"),
    ]));
    let conversation = h.service.create_conversation(USER, None).await?;
    let pair = h.service.submit_prompt(&conversation, USER, "Hello").await?;

    let (tx, mut rx) = mpsc::channel(64);
    h.service.stream_assistant_message(&conversation, &pair.assistant_message, USER, tx).await;
    let events = drain(&mut rx);

    assert_eq!(events.len(), 3);
    assert!(matches!(&events[1], StreamEvent::Error { message } if message.contains("connection reset")));
    assert_eq!(events[2], StreamEvent::Done);

    let stored = h.repo.find_message(&pair.assistant_message.id).await?.unwrap();
    assert_eq!(stored.status, MessageStatus::Error);
    assert!(stored.error_message.unwrap().contains("connection reset"));
    let log = &h.repo.request_logs().await[0];
    assert_eq!(log.status, GenerationStatus::Error);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_backend_emits_error_then_done() -> Result<()> {
    let h = harness(Arc::new(common::UnreachableBackend));
    let conversation = h.service.create_conversation(USER, None).await?;
    let pair = h.service.submit_prompt(&conversation, USER, "Hello").await?;

    let (tx, mut rx) = mpsc::channel(64);
    h.service.stream_assistant_message(&conversation, &pair.assistant_message, USER, tx).await;
    let events = drain(&mut rx);

    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], StreamEvent::Error { message } if message.contains("rag.invalid")));
    assert_eq!(events[1], StreamEvent::Done);
    let stored = h.repo.find_message(&pair.assistant_message.id).await?.unwrap();
    assert_eq!(stored.status, MessageStatus::Error);
    Ok(())
}

#[tokio::test]
async fn test_malformed_lines_are_relayed_as_text() -> Result<()> {
    let h = harness(ScriptedBackend::chunks(&["not json at all\n\n{\"response\": \"ok\"}\n"]));
    let conversation = h.service.create_conversation(USER, None).await?;
    let pair = h.service.submit_prompt(&conversation, USER, "Hello").await?;

    let (tx, mut rx) = mpsc::channel(64);
    h.service.stream_assistant_message(&conversation, &pair.assistant_message, USER, tx).await;

    assert_eq!(
        drain(&mut rx),
        vec![
            StreamEvent::Token { text: "not json at all".into() },
            StreamEvent::Token { text: "ok".into() },
            StreamEvent::Done,
        ]
    );
    let stored = h.repo.find_message(&pair.assistant_message.id).await?.unwrap();
    assert_eq!(stored.status, MessageStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn test_terminal_message_is_replayed_without_backend_call() -> Result<()> {
    let backend = ScriptedBackend::chunks(HELLO_BODY);
    let h = harness(backend.clone());
    let conversation = h.service.create_conversation(USER, None).await?;
    let pair = h.service.submit_prompt(&conversation, USER, "Hello").await?;

    let (tx, _rx) = mpsc::channel(64);
    h.service.stream_assistant_message(&conversation, &pair.assistant_message, USER, tx).await;

    let (tx, mut rx) = mpsc::channel(64);
    h.service.stream_assistant_message(&conversation, &pair.assistant_message, USER, tx).await;

    assert_eq!(
        drain(&mut rx),
        vec![
            StreamEvent::Token { text: "Hi there".into() },
            StreamEvent::Sources { sources: vec![json!("doc.md")] },
            StreamEvent::Done,
        ]
    );
    assert_eq!(backend.calls(), 1);
    assert_eq!(h.repo.request_logs().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_second_stream_for_same_message_is_refused() -> Result<()> {
    let backend = ScriptedBackend::chunks(HELLO_BODY);
    let h = harness(backend.clone());
    let conversation = h.service.create_conversation(USER, None).await?;
    let pair = h.service.submit_prompt(&conversation, USER, "Hello").await?;

    assert!(h.repo.claim_stream(&pair.assistant_message.id, chrono::Utc::now()).await?);

    let (tx, mut rx) = mpsc::channel(64);
    h.service.stream_assistant_message(&conversation, &pair.assistant_message, USER, tx).await;
    let events = drain(&mut rx);

    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], StreamEvent::Error { .. }));
    assert_eq!(events[1], StreamEvent::Done);
    assert_eq!(backend.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_generation_persists_after_client_disconnect() -> Result<()> {
    let h = harness(ScriptedBackend::chunks(HELLO_BODY));
    let conversation = h.service.create_conversation(USER, None).await?;
    let pair = h.service.submit_prompt(&conversation, USER, "Hello").await?;

    let (tx, rx) = mpsc::channel(64);
    drop(rx);
    h.service.stream_assistant_message(&conversation, &pair.assistant_message, USER, tx).await;

    let stored = h.repo.find_message(&pair.assistant_message.id).await?.unwrap();
    assert_eq!(stored.status, MessageStatus::Completed);
    assert_eq!(stored.content.as_deref(), Some("Hi there"));
    Ok(())
}

#[tokio::test]
async fn test_conversations_are_scoped_to_owner() -> Result<()> {
    let h = harness(ScriptedBackend::chunks(&[]));
    let mine = h.service.create_conversation(USER, Some("Mine".into())).await?;
    h.service.create_conversation("user-2", None).await?;

    let listed = h.service.get_conversations(USER).await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].title, "Mine");

    let err = h.service.get_messages(&mine.id, "user-2").await.unwrap_err();
    assert!(err.is_not_found());

    let renamed = h.service.rename_conversation(&mine.id, USER, "  Renamed ").await?;
    assert_eq!(renamed.title, "Renamed");
    assert!(h.service.rename_conversation(&mine.id, USER, " ").await.unwrap_err().is_validation());

    h.service.archive_conversation(&mine.id, USER).await?;
    assert!(h.service.get_conversations(USER).await?.is_empty());
    assert!(h.service.get_conversation(&mine.id, USER).await.unwrap_err().is_not_found());
    Ok(())
}
