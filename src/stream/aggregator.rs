//! Stream Aggregator
//!
//! Consumes a chunked model stream, keeps the accumulated reply, and mirrors
//! it onto a sink through the chunker at a fixed cadence that does not depend
//! on how fast chunks arrive. The abort token is polled between chunks;
//! nothing received after it is set reaches the sink. A source that goes
//! silent for longer than the idle timeout fails the stream.

use super::chunker::{OutputChunker, OutputSink, SinkUnitId};
use super::decoder::{GenerationChunk, NdjsonDecoder, TokenUsage};
use super::extract::{Extraction, SideChannelExtractor};
use super::policy::{PersistDecision, PersistencePolicy};
use super::ChunkSource;
use crate::config::StreamConfig;
use crate::error::CoreError;
use crate::periodic::PeriodicHandle;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Progress notifications for whoever drives the surrounding UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The first sink unit exists; typing indicators can stop
    FirstUnitMaterialized,
    /// First side-channel marker seen; sent at most once per stream
    MarkerExtracted(String),
    Completed { chars: usize, units: usize },
    Cancelled,
    Failed(String),
}

/// Final state of a stream that ran to its end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCompletion {
    /// Visible reply, markers removed
    pub text: String,
    /// Reply exactly as the model produced it
    pub raw: String,
    pub first_marker: Option<String>,
    pub markers: Vec<String>,
    pub usage: TokenUsage,
    pub persist: PersistDecision,
    pub units: Vec<SinkUnitId>,
}

/// Cancellation is an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed(StreamCompletion),
    Cancelled,
}

impl StreamOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamOutcome::Cancelled)
    }
}

pub struct StreamAggregator {
    decoder: NdjsonDecoder,
    raw: String,
    extraction: Extraction,
    chunker: OutputChunker,
    extractor: Arc<dyn SideChannelExtractor>,
    policy: Arc<PersistencePolicy>,
    usage: TokenUsage,
    abort: CancellationToken,
    flush_interval: Duration,
    settle_delay: Duration,
    idle_timeout: Duration,
    indicator: Option<PeriodicHandle>,
    events: Option<UnboundedSender<StreamEvent>>,
    marker_reported: bool,
    first_unit_reported: bool,
    done: bool,
}

impl StreamAggregator {
    pub fn new(
        config: &StreamConfig,
        chunker: OutputChunker,
        extractor: Arc<dyn SideChannelExtractor>,
        policy: Arc<PersistencePolicy>,
        abort: CancellationToken,
    ) -> Self {
        Self {
            decoder: NdjsonDecoder::new(),
            raw: String::new(),
            extraction: Extraction::default(),
            chunker,
            extractor,
            policy,
            usage: TokenUsage::default(),
            abort,
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            idle_timeout: Duration::from_millis(config.idle_timeout_ms.max(1)),
            indicator: None,
            events: None,
            marker_reported: false,
            first_unit_reported: false,
            done: false,
        }
    }

    /// Stop `indicator` right before the first unit is created, and on every
    /// exit path.
    pub fn with_indicator(mut self, indicator: PeriodicHandle) -> Self {
        self.indicator = Some(indicator);
        self
    }

    pub fn with_events(mut self, events: UnboundedSender<StreamEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the abort flag; the loop notices it before applying another chunk.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn text(&self) -> &str {
        &self.extraction.cleaned
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Decode and apply one raw network chunk. Returns whether the model
    /// signalled the end of its reply.
    ///
    /// Nothing is applied once the abort flag is set. Malformed lines are
    /// logged and skipped; an in-band model error fails the stream.
    pub fn feed_chunk(&mut self, bytes: &[u8]) -> Result<bool, CoreError> {
        if self.abort.is_cancelled() {
            return Ok(self.done);
        }
        for decoded in self.decoder.push(bytes) {
            match decoded {
                Ok(chunk) => self.apply(&chunk),
                Err(CoreError::MalformedChunk(reason)) => {
                    warn!(reason = %reason, "Skipping malformed stream line");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(self.done)
    }

    /// Apply an already decoded chunk.
    pub fn apply(&mut self, chunk: &GenerationChunk) {
        if self.abort.is_cancelled() {
            return;
        }
        self.usage.absorb(chunk);
        if chunk.done {
            self.done = true;
        }
        if chunk.content.is_empty() {
            return;
        }
        self.raw.push_str(&chunk.content);
        self.reextract(false);
    }

    fn reextract(&mut self, finished: bool) {
        self.extraction = if finished {
            self.extractor.extract(&self.raw)
        } else {
            self.extractor.extract_streaming(&self.raw)
        };
        self.chunker.set_document(&self.extraction.cleaned);

        if !self.marker_reported {
            if let Some(marker) = self.extraction.first_marker() {
                self.marker_reported = true;
                debug!(marker = %marker, "Side-channel marker extracted");
                self.emit(StreamEvent::MarkerExtracted(marker.to_string()));
            }
        }
    }

    /// Push pending text to the sink. Does nothing once aborted.
    pub async fn flush(&mut self, sink: &dyn OutputSink) -> Result<usize, CoreError> {
        if self.abort.is_cancelled() {
            return Ok(0);
        }
        if self.chunker.first_unit_pending() {
            self.stop_indicator();
        }
        let mutations = self.chunker.flush(sink).await?;
        self.report_first_unit();
        Ok(mutations)
    }

    /// The model is done: let the last edit settle, then materialize and
    /// finalize the reply.
    pub async fn finish(&mut self, sink: &dyn OutputSink) -> Result<StreamOutcome, CoreError> {
        let abort = self.abort.clone();
        tokio::select! {
            biased;
            _ = abort.cancelled() => return Ok(self.cancelled()),
            _ = tokio::time::sleep(self.settle_delay) => {}
        }
        if abort.is_cancelled() {
            return Ok(self.cancelled());
        }

        match self.decoder.finish() {
            Some(Ok(chunk)) => self.apply(&chunk),
            Some(Err(CoreError::MalformedChunk(reason))) => {
                warn!(reason = %reason, "Skipping malformed trailing line");
            }
            Some(Err(err)) => return Err(self.failed(err)),
            None => {}
        }

        self.reextract(true);
        self.stop_indicator();
        let result = async {
            self.chunker.flush(sink).await?;
            self.chunker.finalize(sink).await
        }
        .await;
        if let Err(err) = result {
            return Err(self.failed(err));
        }
        self.report_first_unit();

        let persist = self.policy.evaluate(&self.extraction.cleaned);
        let completion = StreamCompletion {
            text: self.extraction.cleaned.clone(),
            raw: self.raw.clone(),
            first_marker: self.extraction.first_marker().map(str::to_string),
            markers: self.extraction.markers.clone(),
            usage: self.usage,
            persist,
            units: self.chunker.units(),
        };

        info!(
            chars = completion.text.chars().count(),
            units = completion.units.len(),
            prompt_eval_count = ?completion.usage.prompt_eval_count,
            eval_count = ?completion.usage.eval_count,
            persist = ?persist,
            "Stream completed"
        );
        self.emit(StreamEvent::Completed {
            chars: completion.text.chars().count(),
            units: completion.units.len(),
        });
        Ok(StreamOutcome::Completed(completion))
    }

    /// Drive `source` to its end, flushing on a timer, then finish.
    ///
    /// A source that ends without a final `done` line is treated as done.
    pub async fn run(
        mut self,
        mut source: ChunkSource,
        sink: &dyn OutputSink,
    ) -> Result<StreamOutcome, CoreError> {
        let abort = self.abort.clone();
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.flush_interval,
            self.flush_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let idle_timeout = self.idle_timeout;
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            if abort.is_cancelled() {
                return Ok(self.cancelled());
            }

            tokio::select! {
                biased;
                _ = abort.cancelled() => return Ok(self.cancelled()),
                _ = ticker.tick() => {
                    if let Err(err) = self.flush(sink).await {
                        return Err(self.failed(err));
                    }
                }
                next = source.next() => match next {
                    Some(Ok(bytes)) => {
                        if abort.is_cancelled() {
                            return Ok(self.cancelled());
                        }
                        idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                        match self.feed_chunk(&bytes) {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(err) => return Err(self.failed(err)),
                        }
                    }
                    Some(Err(err)) => return Err(self.failed(err)),
                    None => {
                        if !self.done {
                            debug!("Chunk source ended without a done marker");
                        }
                        break;
                    }
                },
                _ = &mut idle => {
                    let err = CoreError::Transport(format!(
                        "No chunk received for {} ms",
                        idle_timeout.as_millis()
                    ));
                    return Err(self.failed(err));
                }
            }
        }

        self.finish(sink).await
    }

    fn cancelled(&mut self) -> StreamOutcome {
        self.stop_indicator();
        info!(
            chars = self.extraction.cleaned.chars().count(),
            units = self.chunker.unit_count(),
            "Stream cancelled"
        );
        self.emit(StreamEvent::Cancelled);
        StreamOutcome::Cancelled
    }

    fn failed(&mut self, err: CoreError) -> CoreError {
        self.stop_indicator();
        warn!(error = %err, "Stream failed");
        self.emit(StreamEvent::Failed(err.to_string()));
        err
    }

    fn report_first_unit(&mut self) {
        if !self.first_unit_reported && self.chunker.has_units() {
            self.first_unit_reported = true;
            self.emit(StreamEvent::FirstUnitMaterialized);
        }
    }

    fn stop_indicator(&mut self) {
        if let Some(mut indicator) = self.indicator.take() {
            indicator.stop();
        }
    }

    fn emit(&self, event: StreamEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}
