//! Integration tests for the scheduler
//!
//! Tests cover:
//! - A submitted chat streams its reply and releases every registration
//! - A second submission from a busy owner is refused
//! - Failures and aborts end with the configured notice in the sink
//! - The global lane serializes heavy jobs
//! - Stopping a channel respects stream ownership
//! - A tracked generation animates its progress unit until cancelled

use netricsa::config::BotConfig;
use netricsa::error::CoreError;
use netricsa::provider::ChatSource;
use netricsa::scheduler::{ChatSubmission, Scheduler};
use netricsa::stream::{OutputSink, StreamEvent, StreamOutcome};
use netricsa::types::GenerationKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::integration::test_utils::{
    channel_source, chat_line, done_line, scripted_source, RecordingCancel, RecordingSink,
    ScriptedChat, SinkCall,
};

fn scheduler(chat: Arc<ScriptedChat>) -> Scheduler {
    let (transport, _rx) = RecordingCancel::new();
    let source: Arc<dyn ChatSource> = chat;
    Scheduler::new(BotConfig::default(), source, Arc::new(transport)).unwrap()
}

fn sink_handle(sink: &Arc<RecordingSink>) -> Arc<dyn OutputSink> {
    Arc::clone(sink) as Arc<dyn OutputSink>
}

#[tokio::test(start_paused = true)]
async fn test_submitted_chat_streams_reply_and_releases_owner() {
    let chat = Arc::new(ScriptedChat::new(vec![scripted_source(&[
        "Bonjour, ",
        "je suis là pour vous aider",
    ])]));
    let scheduler = scheduler(Arc::clone(&chat));
    let sink = Arc::new(RecordingSink::default());

    let handle = scheduler
        .submit_chat(
            ChatSubmission::new("c1", "u1", "Salut Netricsa"),
            sink_handle(&sink),
        )
        .unwrap();
    assert!(scheduler.occupancy().contains("u1"));

    match handle.await.unwrap() {
        StreamOutcome::Completed(completion) => {
            assert_eq!(completion.text, "Bonjour, je suis là pour vous aider");
        }
        StreamOutcome::Cancelled => panic!("unexpected cancellation"),
    }
    assert_eq!(sink.units(), vec!["Bonjour, je suis là pour vous aider"]);
    assert_eq!(chat.requests(), 1);
    assert_eq!(chat.last_prompt().as_deref(), Some("Salut Netricsa"));

    let stats = scheduler.stats();
    assert_eq!(stats.queued_owners, 0);
    assert_eq!(stats.active_streams, 0);
    assert_eq!(stats.channels.completed, 1);
    assert_eq!(stats.channels.active_keys, 0);
}

#[tokio::test(start_paused = true)]
async fn test_busy_owner_is_refused_until_released() {
    let (chunks, pending) = channel_source();
    let chat = Arc::new(ScriptedChat::new(vec![
        pending,
        scripted_source(&["Une deuxième réponse pour u2"]),
    ]));
    let scheduler = scheduler(chat);
    let sink = Arc::new(RecordingSink::default());

    let first = scheduler
        .submit_chat(ChatSubmission::new("c1", "u1", "première"), sink_handle(&sink))
        .unwrap();

    let refused = scheduler.submit_chat(ChatSubmission::new("c2", "u1", "encore"), sink_handle(&sink));
    assert!(matches!(refused, Err(CoreError::OwnerBusy(owner)) if owner == "u1"));

    // Another owner queues behind the first job in the same channel.
    let second = scheduler
        .submit_chat(ChatSubmission::new("c1", "u2", "moi aussi"), sink_handle(&sink))
        .unwrap();
    assert_eq!(scheduler.stats().queued_owners, 2);

    chunks
        .unbounded_send(Ok(chat_line("Une première réponse pour u1")))
        .unwrap();
    chunks.unbounded_send(Ok(done_line(3, 5))).unwrap();

    assert!(!first.await.unwrap().is_cancelled());
    assert!(!second.await.unwrap().is_cancelled());
    assert_eq!(
        sink.units(),
        vec!["Une première réponse pour u1", "Une deuxième réponse pour u2"]
    );
    assert!(scheduler.occupancy().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failure_sends_failed_notice_and_frees_owner() {
    let chat = Arc::new(ScriptedChat::new(Vec::new()));
    let scheduler = scheduler(chat);
    let sink = Arc::new(RecordingSink::default());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let handle = scheduler
        .submit_chat(
            ChatSubmission::new("c1", "u1", "allô ?").with_events(events_tx),
            sink_handle(&sink),
        )
        .unwrap();
    let err = handle.await.unwrap_err();
    assert!(matches!(err, CoreError::Transport(_)));

    let failed_notice = BotConfig::default().notices.failed;
    assert_eq!(sink.units(), vec![failed_notice]);
    assert!(matches!(events_rx.try_recv(), Ok(StreamEvent::Failed(_))));

    assert!(!scheduler.occupancy().contains("u1"));
    assert_eq!(scheduler.stats().channels.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_abort_channel_sends_cancelled_notice() {
    let (chunks, pending) = channel_source();
    let chat = Arc::new(ScriptedChat::new(vec![pending]));
    let scheduler = scheduler(chat);
    let sink = Arc::new(RecordingSink::default());

    let handle = scheduler
        .submit_chat(ChatSubmission::new("c1", "u1", "raconte"), sink_handle(&sink))
        .unwrap();

    chunks.unbounded_send(Ok(chat_line("Il était"))).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.streams().count(), 1);

    assert!(scheduler.abort_channel("c1"));
    chunks.unbounded_send(Ok(chat_line(" une fois"))).unwrap();

    assert!(handle.await.unwrap().is_cancelled());
    let cancelled_notice = BotConfig::default().notices.cancelled.unwrap();
    assert_eq!(sink.units(), vec![cancelled_notice]);
    assert_eq!(scheduler.streams().count(), 0);
    assert!(!scheduler.abort_channel("c1"));
}

#[tokio::test(start_paused = true)]
async fn test_stop_in_respects_stream_ownership() {
    let (_chunks, pending) = channel_source();
    let chat = Arc::new(ScriptedChat::new(vec![pending]));
    let scheduler = scheduler(chat);
    let sink = Arc::new(RecordingSink::default());

    let handle = scheduler
        .submit_chat(ChatSubmission::new("c1", "u1", "long récit"), sink_handle(&sink))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!scheduler.stop_in("c1", "u2", false));
    assert!(!scheduler.streams().is_aborted("c1"));
    assert!(scheduler.stop_in("c1", "u2", true));

    assert!(handle.await.unwrap().is_cancelled());
}

#[tokio::test]
async fn test_global_lane_runs_jobs_one_at_a_time() {
    let scheduler = scheduler(Arc::new(ScriptedChat::default()));
    let running = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..3u32 {
        let running = Arc::clone(&running);
        handles.push(scheduler.enqueue_globally(move || async move {
            assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
            tokio::time::sleep(Duration::from_millis(5)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(i)
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), i as u32);
    }
    assert_eq!(scheduler.stats().global.completed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_generation_progress_animates_until_cancelled() {
    let mut config = BotConfig::default();
    config.stream.indicator_interval_ms = 100;
    let (transport, _rx) = RecordingCancel::new();
    let transport = Arc::new(transport);
    let source: Arc<dyn ChatSource> = Arc::new(ScriptedChat::default());
    let scheduler = Scheduler::new(config, source, transport.clone()).unwrap();
    let sink = Arc::new(RecordingSink::default());

    let unit = scheduler
        .track_generation("u1", "c1", GenerationKind::Imagine, sink_handle(&sink), "Génération")
        .await
        .unwrap();
    assert_eq!(unit.0, 0);
    assert!(scheduler.generations().get_active("u1").unwrap().has_periodic);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(
        sink.calls(),
        vec![
            SinkCall::Create("Génération.".to_string()),
            SinkCall::Update(0, "Génération..".to_string()),
            SinkCall::Update(0, "Génération...".to_string()),
        ]
    );

    assert!(scheduler.cancel_generation("u1"));
    let seen = sink.mutation_count();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(sink.mutation_count(), seen);
    assert_eq!(transport.markers().len(), 1);
}
