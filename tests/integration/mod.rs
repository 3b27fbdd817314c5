//! Integration tests for the netricsa job core

mod chunker_flush;
mod config_loading;
mod scheduler_flow;
mod stream_pipeline;
pub mod test_utils;
