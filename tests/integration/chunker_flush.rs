//! Integration tests for the output chunker
//!
//! Tests cover:
//! - One overflow yields exactly two segments, the first frozen at the limit
//! - Flushing twice without new text costs one sink mutation
//! - Units are created in segment order, and only the tail is edited
//! - Finalize forces a last update

use netricsa::stream::{OutputChunker, SinkCleaner};

use crate::integration::test_utils::{RecordingSink, SinkCall};

#[test]
fn test_single_overflow_yields_exactly_two_segments() {
    let max = 1900;
    let mut chunker = OutputChunker::new(max, 20);
    let text: String = "ab".repeat(1000);
    chunker.set_full_text(&text);

    let segments = chunker.segments();
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].chars().count(), max);
    assert_eq!(segments[0], &text[..max]);
    assert_eq!(segments[1], &text[max..]);
}

#[tokio::test]
async fn test_double_flush_mutates_once() {
    let sink = RecordingSink::default();
    let mut chunker = OutputChunker::new(1900, 0);

    chunker.append_text("hello");
    assert_eq!(chunker.flush(&sink).await.unwrap(), 1);
    assert_eq!(chunker.flush(&sink).await.unwrap(), 0);

    assert_eq!(sink.calls(), vec![SinkCall::Create("hello".to_string())]);
}

#[tokio::test]
async fn test_units_follow_segment_order_and_only_tail_is_edited() {
    let sink = RecordingSink::default();
    let mut chunker = OutputChunker::new(5, 0);

    chunker.append_text("abc");
    chunker.flush(&sink).await.unwrap();
    chunker.append_text("defghijkl");
    chunker.flush(&sink).await.unwrap();
    chunker.append_text("mn");
    chunker.flush(&sink).await.unwrap();

    assert_eq!(sink.units(), vec!["abcde", "fghij", "klmn"]);
    assert_eq!(
        sink.calls(),
        vec![
            SinkCall::Create("abc".to_string()),
            SinkCall::Update(0, "abcde".to_string()),
            SinkCall::Create("fghij".to_string()),
            SinkCall::Create("kl".to_string()),
            SinkCall::Update(2, "klmn".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_finalize_forces_last_update_and_first_unit() {
    let sink = RecordingSink::default();
    let mut chunker = OutputChunker::new(1900, 20);

    chunker.append_text("Hi");
    assert_eq!(chunker.flush(&sink).await.unwrap(), 0);
    assert_eq!(chunker.finalize(&sink).await.unwrap(), 2);

    assert_eq!(
        sink.calls(),
        vec![
            SinkCall::Create("Hi".to_string()),
            SinkCall::Update(0, "Hi".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_cleaner_applies_to_unit_bodies() {
    let sink = RecordingSink::default();
    let mut chunker = OutputChunker::new(1900, 0).with_cleaner(SinkCleaner::new().unwrap());

    chunker.append_text("voir https://example.com/docs");
    chunker.flush(&sink).await.unwrap();
    assert_eq!(sink.units(), vec!["voir <https://example.com/docs>"]);

    // The raw segment is unchanged; a second flush sees no difference.
    assert_eq!(chunker.flush(&sink).await.unwrap(), 0);
    assert_eq!(chunker.segments(), vec!["voir https://example.com/docs"]);
}
