//! Output Chunker
//!
//! Pages unbounded, growing text into sink units of bounded size. Segments
//! are forward-only: once a segment overflows, its first `max_segment_chars`
//! characters are frozen and the rest opens the next segment. Only the last
//! segment ever receives new text, and only the most recently materialized
//! sink unit is edited.

use super::extract::SinkCleaner;
use crate::config::StreamConfig;
use crate::error::CoreError;
use async_trait::async_trait;
use tracing::{debug, trace};

/// Identifier of a unit created by a sink (a chat message).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkUnitId(pub u64);

/// Destination of paged output.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn create_unit(&self, content: &str) -> Result<SinkUnitId, CoreError>;

    async fn update_unit(&self, id: SinkUnitId, content: &str) -> Result<(), CoreError>;
}

#[derive(Debug, Clone, Default)]
struct Segment {
    text: String,
    unit: Option<SinkUnitId>,
    /// Last body sent to the sink for `unit`
    sent: Option<String>,
    /// Closed with nothing printable; never gets a unit
    skipped: bool,
}

/// What a flush does with the first segment that has no unit yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Create,
    Skip,
    Wait,
}

/// Splits text into segments and mirrors them onto an [`OutputSink`].
#[derive(Debug, Clone)]
pub struct OutputChunker {
    segments: Vec<Segment>,
    max_segment_chars: usize,
    min_first_unit_chars: usize,
    /// Characters of the document held by closed segments
    closed_chars: usize,
    cleaner: Option<SinkCleaner>,
}

impl OutputChunker {
    /// `max_segment_chars` is clamped to at least one character.
    pub fn new(max_segment_chars: usize, min_first_unit_chars: usize) -> Self {
        Self {
            segments: vec![Segment::default()],
            max_segment_chars: max_segment_chars.max(1),
            min_first_unit_chars,
            closed_chars: 0,
            cleaner: None,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.max_segment_chars, config.min_first_unit_chars)
    }

    /// Clean every unit body with `cleaner` before it reaches the sink.
    pub fn with_cleaner(mut self, cleaner: SinkCleaner) -> Self {
        self.cleaner = Some(cleaner);
        self
    }

    /// Replace the text of the current (last) segment, splitting off new
    /// segments while it exceeds the maximum size.
    pub fn set_full_text(&mut self, text: &str) {
        let max = self.max_segment_chars;
        let mut rest = text;
        loop {
            let (head, tail) = split_at_chars(rest, max);
            self.current_mut().text = head.to_string();
            if tail.is_empty() {
                break;
            }
            self.closed_chars += max;
            debug!(
                segment = self.segments.len(),
                max_segment_chars = max,
                "Segment full; opening a new one"
            );
            self.segments.push(Segment::default());
            rest = tail;
        }
    }

    /// Append `delta` to the current segment.
    pub fn append_text(&mut self, delta: &str) {
        let mut text = std::mem::take(&mut self.current_mut().text);
        text.push_str(delta);
        self.set_full_text(&text);
    }

    /// Set the whole document. Characters already held by closed segments are
    /// skipped; only the remainder is applied to the current segment.
    pub fn set_document(&mut self, document: &str) {
        let (_, open) = split_at_chars(document, self.closed_chars);
        self.set_full_text(open);
    }

    /// Whether the next flush would create the very first unit.
    pub fn first_unit_pending(&self) -> bool {
        if self.has_units() {
            return false;
        }
        for index in 0..self.segments.len() {
            match self.pending(index, false) {
                Pending::Create => return true,
                Pending::Skip => continue,
                Pending::Wait => return false,
            }
        }
        false
    }

    /// Create units for pending segments in order, then bring the most recent
    /// unit up to date. Returns the number of sink mutations.
    pub async fn flush(&mut self, sink: &dyn OutputSink) -> Result<usize, CoreError> {
        self.sync(sink, false).await
    }

    /// Materialize everything left and rewrite the last unit with its final
    /// content, changed or not.
    pub async fn finalize(&mut self, sink: &dyn OutputSink) -> Result<usize, CoreError> {
        let mut mutations = self.sync(sink, true).await?;
        if let Some(index) = self.last_materialized() {
            let body = self.body(index);
            let segment = &mut self.segments[index];
            if let Some(id) = segment.unit {
                sink.update_unit(id, &body).await?;
                segment.sent = Some(body);
                mutations += 1;
            }
        }
        debug!(units = self.unit_count(), mutations, "Chunker finalized");
        Ok(mutations)
    }

    async fn sync(&mut self, sink: &dyn OutputSink, force: bool) -> Result<usize, CoreError> {
        let mut mutations = 0;

        // The current tail gets its closing content before any later unit
        // supersedes it.
        if let Some(index) = self.last_materialized() {
            mutations += self.update_if_changed(sink, index).await?;
        }

        let first_pending = self
            .segments
            .iter()
            .take_while(|s| s.unit.is_some() || s.skipped)
            .count();
        for index in first_pending..self.segments.len() {
            match self.pending(index, force) {
                Pending::Wait => break,
                Pending::Skip => {
                    trace!(segment = index, "Blank closed segment skipped");
                    self.segments[index].skipped = true;
                }
                Pending::Create => {
                    let body = self.body(index);
                    let id = sink.create_unit(&body).await?;
                    trace!(segment = index, unit = id.0, chars = body.chars().count(), "Unit created");
                    let segment = &mut self.segments[index];
                    segment.unit = Some(id);
                    segment.sent = Some(body);
                    mutations += 1;
                }
            }
        }
        Ok(mutations)
    }

    async fn update_if_changed(
        &mut self,
        sink: &dyn OutputSink,
        index: usize,
    ) -> Result<usize, CoreError> {
        let body = self.body(index);
        let segment = &mut self.segments[index];
        let Some(id) = segment.unit else {
            return Ok(0);
        };
        if segment.sent.as_deref() == Some(body.as_str()) || body.is_empty() {
            return Ok(0);
        }
        sink.update_unit(id, &body).await?;
        segment.sent = Some(body);
        Ok(1)
    }

    /// Only the open last segment can still change, so it is the only one
    /// worth waiting for.
    fn pending(&self, index: usize, force: bool) -> Pending {
        let closed = index + 1 < self.segments.len();
        let trimmed = self.segments[index].text.trim();
        if trimmed.is_empty() || self.body(index).trim().is_empty() {
            return if closed { Pending::Skip } else { Pending::Wait };
        }
        if closed
            || force
            || self.has_units()
            || trimmed.chars().count() >= self.min_first_unit_chars
        {
            Pending::Create
        } else {
            Pending::Wait
        }
    }

    fn body(&self, index: usize) -> String {
        let text = &self.segments[index].text;
        match &self.cleaner {
            Some(cleaner) => cleaner.clean(text),
            None => text.clone(),
        }
    }

    fn last_materialized(&self) -> Option<usize> {
        self.segments.iter().rposition(|s| s.unit.is_some())
    }

    fn current_mut(&mut self) -> &mut Segment {
        if self.segments.is_empty() {
            self.segments.push(Segment::default());
        }
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    pub fn segments(&self) -> Vec<&str> {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn units(&self) -> Vec<SinkUnitId> {
        self.segments.iter().filter_map(|s| s.unit).collect()
    }

    pub fn unit_count(&self) -> usize {
        self.segments.iter().filter(|s| s.unit.is_some()).count()
    }

    pub fn has_units(&self) -> bool {
        self.segments.iter().any(|s| s.unit.is_some())
    }
}

/// Split after `n` characters, on a char boundary.
pub fn split_at_chars(text: &str, n: usize) -> (&str, &str) {
    match text.char_indices().nth(n) {
        Some((idx, _)) => text.split_at(idx),
        None => (text, ""),
    }
}
