//! Netricsa: keyed sequential job core for a persona chat bot
//!
//! Jobs are serialized per channel, image generations stay cancellable while
//! their remote job id is still unknown, and streamed model replies are paged
//! onto a bounded-size sink at a fixed cadence with cooperative abort.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod periodic;
pub mod provider;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod stream;
pub mod types;

pub use error::CoreError;
pub use queue::{JobHandle, KeyedSequentialQueue};
pub use registry::GenerationRegistry;
pub use scheduler::{ChatSubmission, Scheduler};
pub use stream::{OutputChunker, OutputSink, StreamAggregator, StreamOutcome};
