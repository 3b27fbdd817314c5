//! Integration tests for the streaming pipeline
//!
//! Tests cover:
//! - A queued job streaming "He" + "llo" ends with one unit reading "Hello"
//! - An abort stops the stream; later chunks never reach the sink
//! - Transport failures fail the job, malformed lines are skipped
//! - A silent source fails after the idle timeout, a slow one does not
//! - Usage counters, side-channel markers and the typing indicator

use netricsa::config::{PolicyConfig, StreamConfig};
use netricsa::error::CoreError;
use netricsa::periodic::start_periodic;
use netricsa::queue::KeyedSequentialQueue;
use netricsa::stream::{
    ActiveStreamRegistry, OutputChunker, PersistDecision, PersistencePolicy, ReactionExtractor,
    StreamAggregator, StreamEvent, StreamOutcome,
};
use netricsa::types::OperationKind;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::integration::test_utils::{
    channel_source, chat_line, done_line, scripted_source, RecordingSink, SinkCall,
};

fn aggregator(config: &StreamConfig, abort: CancellationToken) -> StreamAggregator {
    StreamAggregator::new(
        config,
        OutputChunker::from_config(config),
        Arc::new(ReactionExtractor::new("Netricsa").unwrap()),
        Arc::new(PersistencePolicy::new(&PolicyConfig::default()).unwrap()),
        abort,
    )
}

fn completed(outcome: StreamOutcome) -> netricsa::stream::StreamCompletion {
    match outcome {
        StreamOutcome::Completed(completion) => completion,
        StreamOutcome::Cancelled => panic!("stream was cancelled"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_queued_stream_produces_single_hello_unit() {
    let queue: KeyedSequentialQueue<String> = KeyedSequentialQueue::new();
    let sink = Arc::new(RecordingSink::default());
    let config = StreamConfig::default();

    let job_sink = Arc::clone(&sink);
    let handle = queue.enqueue("c1".to_string(), move || async move {
        aggregator(&config, CancellationToken::new())
            .run(scripted_source(&["He", "llo"]), job_sink.as_ref())
            .await
    });

    let completion = completed(handle.await.unwrap());
    assert_eq!(completion.text, "Hello");
    assert_eq!(completion.units.len(), 1);
    assert_eq!(sink.units(), vec!["Hello"]);
    assert_eq!(
        sink.calls().first(),
        Some(&SinkCall::Create("Hello".to_string()))
    );
    assert_eq!(completion.usage.prompt_eval_count, Some(12));
    assert_eq!(completion.usage.eval_count, Some(2));
    assert_eq!(completion.persist, PersistDecision::Persist);
}

#[tokio::test(start_paused = true)]
async fn test_abort_stops_stream_before_next_chunk() {
    let queue: KeyedSequentialQueue<String> = KeyedSequentialQueue::new();
    let streams = Arc::new(ActiveStreamRegistry::new());
    let sink = Arc::new(RecordingSink::default());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (chunks, source) = channel_source();
    let config = StreamConfig {
        min_first_unit_chars: 0,
        ..StreamConfig::default()
    };

    let ticket = streams.register("c1", "u1", OperationKind::Llm);
    let job_sink = Arc::clone(&sink);
    let job_streams = Arc::clone(&streams);
    let handle = queue.enqueue("c1".to_string(), move || async move {
        let outcome = aggregator(&config, ticket.token.clone())
            .with_events(events_tx)
            .run(source, job_sink.as_ref())
            .await;
        job_streams.unregister(&ticket);
        outcome
    });

    chunks.unbounded_send(Ok(chat_line("Bonjour à tous "))).unwrap();
    // Past the first flush tick.
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(sink.units(), vec!["Bonjour à tous "]);
    let mutations_before_abort = sink.mutation_count();

    assert!(streams.abort("c1"));
    chunks.unbounded_send(Ok(chat_line(" SECRET"))).unwrap();
    chunks.unbounded_send(Ok(done_line(1, 2))).unwrap();

    let outcome = handle.await.unwrap();
    assert!(outcome.is_cancelled());
    assert_eq!(sink.mutation_count(), mutations_before_abort);
    assert!(sink.units().iter().all(|u| !u.contains("SECRET")));
    assert_eq!(streams.count(), 0);

    let mut events = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        events.push(event);
    }
    assert!(events.contains(&StreamEvent::Cancelled));
    assert!(!events
        .iter()
        .any(|e| matches!(e, StreamEvent::Completed { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_fails_the_job_and_queue_advances() {
    let queue: KeyedSequentialQueue<String> = KeyedSequentialQueue::new();
    let sink = Arc::new(RecordingSink::default());
    let config = StreamConfig::default();

    let job_sink = Arc::clone(&sink);
    let failing = queue.enqueue("c1".to_string(), move || async move {
        let source = futures::stream::iter(vec![
            Ok(chat_line("partial")),
            Err(CoreError::Transport("connection reset".to_string())),
        ]);
        aggregator(&config, CancellationToken::new())
            .run(Box::pin(source), job_sink.as_ref())
            .await
    });
    let next = queue.enqueue("c1".to_string(), || async { Ok("next") });

    let err = failing.await.unwrap_err();
    assert!(matches!(err, CoreError::Transport(msg) if msg.contains("reset")));
    assert_eq!(next.await.unwrap(), "next");
}

#[tokio::test(start_paused = true)]
async fn test_malformed_line_is_skipped_and_stream_continues() {
    let sink = RecordingSink::default();
    let config = StreamConfig::default();
    let source = futures::stream::iter(vec![
        Ok(chat_line("Bon")),
        Ok(Bytes::from_static(b"{\"message\": oops\n")),
        Ok(chat_line("jour")),
        Ok(done_line(3, 4)),
    ]);

    let outcome = aggregator(&config, CancellationToken::new())
        .run(Box::pin(source), &sink)
        .await
        .unwrap();
    assert_eq!(completed(outcome).text, "Bonjour");
}

#[tokio::test(start_paused = true)]
async fn test_marker_is_extracted_once_and_removed() {
    let sink = RecordingSink::default();
    let config = StreamConfig::default();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let outcome = aggregator(&config, CancellationToken::new())
        .with_events(events_tx)
        .run(
            scripted_source(&["Salut 😀 ", "content de ", "te voir 🎉"]),
            &sink,
        )
        .await
        .unwrap();

    let completion = completed(outcome);
    assert_eq!(completion.first_marker.as_deref(), Some("😀"));
    assert_eq!(completion.markers, vec!["😀", "🎉"]);
    assert!(!completion.text.contains('😀'));
    assert!(completion.raw.contains('😀'));

    let mut marker_events = 0;
    while let Ok(event) = events_rx.try_recv() {
        if let StreamEvent::MarkerExtracted(marker) = event {
            assert_eq!(marker, "😀");
            marker_events += 1;
        }
    }
    assert_eq!(marker_events, 1);
}

#[tokio::test(start_paused = true)]
async fn test_indicator_stops_when_reply_appears() {
    let sink = RecordingSink::default();
    let config = StreamConfig::default();
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ticks);
    let indicator = start_periodic(Duration::from_millis(500), move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let outcome = aggregator(&config, CancellationToken::new())
        .with_indicator(indicator)
        .run(scripted_source(&["Une réponse assez longue pour un message"]), &sink)
        .await
        .unwrap();
    assert!(!outcome.is_cancelled());

    let after = ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), after);
}

#[tokio::test(start_paused = true)]
async fn test_silent_source_fails_after_idle_timeout() {
    let sink = Arc::new(RecordingSink::default());
    let (chunks, source) = channel_source();
    let config = StreamConfig {
        idle_timeout_ms: 5_000,
        min_first_unit_chars: 0,
        ..StreamConfig::default()
    };

    let job_sink = Arc::clone(&sink);
    let job_config = config.clone();
    let run = tokio::spawn(async move {
        aggregator(&job_config, CancellationToken::new())
            .run(source, job_sink.as_ref())
            .await
    });

    // Chunks spaced under the timeout keep a long reply alive.
    for piece in ["Une ", "réponse ", "lente "] {
        tokio::time::sleep(Duration::from_millis(4_000)).await;
        chunks.unbounded_send(Ok(chat_line(piece))).unwrap();
    }

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, CoreError::Transport(msg) if msg.contains("5000 ms")));
    assert_eq!(sink.units(), vec!["Une réponse lente "]);
}
