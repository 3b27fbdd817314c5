//! Streaming replies: decoding, side-channel extraction, paging onto a sink,
//! and the abort bookkeeping that lets a stop command end a stream early.

pub mod active;
pub mod aggregator;
pub mod chunker;
pub mod decoder;
pub mod extract;
pub mod policy;

use crate::error::CoreError;
use bytes::Bytes;
use futures::stream::BoxStream;

pub use active::{ActiveStreamInfo, ActiveStreamRegistry, StreamTicket};
pub use aggregator::{StreamAggregator, StreamCompletion, StreamEvent, StreamOutcome};
pub use chunker::{OutputChunker, OutputSink, SinkUnitId};
pub use decoder::{GenerationChunk, NdjsonDecoder, TokenUsage};
pub use extract::{Extraction, NoExtraction, ReactionExtractor, SideChannelExtractor, SinkCleaner};
pub use policy::{PersistDecision, PersistencePolicy};

/// Raw byte chunks of a streamed model reply.
pub type ChunkSource = BoxStream<'static, Result<Bytes, CoreError>>;
