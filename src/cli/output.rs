//! CLI output: terminal sink for streamed replies, and error mapping to the
//! CLI surface.

use crate::error::CoreError;
use crate::stream::{OutputSink, SinkUnitId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Write;

/// Map domain errors to a string for CLI output.
pub fn map_error(e: &CoreError) -> String {
    match e {
        CoreError::Transport(msg) => format!("Model unreachable: {}", msg),
        other => other.to_string(),
    }
}

/// A sink that prints units to a terminal.
///
/// A terminal cannot edit what it already printed, so an update whose content
/// extends the printed text prints only the new suffix; any other edit is
/// reprinted in full on a new line.
pub struct ConsoleSink<W: Write + Send> {
    out: Mutex<ConsoleState<W>>,
}

struct ConsoleState<W> {
    writer: W,
    units: Vec<String>,
}

impl ConsoleSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: Mutex::new(ConsoleState {
                writer,
                units: Vec::new(),
            }),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().writer
    }
}

#[async_trait]
impl<W: Write + Send> OutputSink for ConsoleSink<W> {
    async fn create_unit(&self, content: &str) -> Result<SinkUnitId, CoreError> {
        let mut state = self.out.lock();
        if !state.units.is_empty() {
            writeln!(state.writer)?;
        }
        write!(state.writer, "{}", content)?;
        state.writer.flush()?;
        state.units.push(content.to_string());
        Ok(SinkUnitId(state.units.len() as u64 - 1))
    }

    async fn update_unit(&self, id: SinkUnitId, content: &str) -> Result<(), CoreError> {
        let mut state = self.out.lock();
        let index = id.0 as usize;
        let previous = state
            .units
            .get(index)
            .cloned()
            .ok_or_else(|| CoreError::Sink(format!("Unknown unit {}", id.0)))?;

        let is_last = index + 1 == state.units.len();
        match content.strip_prefix(previous.as_str()) {
            Some(suffix) if is_last => write!(state.writer, "{}", suffix)?,
            Some("") => {}
            _ => write!(state.writer, "\n[edit #{}] {}", id.0, content)?,
        }
        state.writer.flush()?;
        state.units[index] = content.to_string();
        Ok(())
    }
}
