use std::any::type_name;
use std::io::{self, Result as IoResult, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use super::event::StreamEvent;

/// Abstraction over an output target that consumes full events.
pub trait EventSink: Send + Sync {
    /// Handle one event. The bus runs each sink on its own worker task, so
    /// blocking I/O here does not stall the run.
    fn handle(&mut self, event: &StreamEvent) -> IoResult<()>;

    /// Stable, human-friendly identifier for this sink instance.
    fn name(&self) -> String {
        type_name::<Self>().to_string()
    }
}

/// Line-per-event stdout sink.
pub struct StdOutSink {
    handle: io::Stdout,
}

impl Default for StdOutSink {
    fn default() -> Self {
        Self {
            handle: io::stdout(),
        }
    }
}

impl EventSink for StdOutSink {
    fn handle(&mut self, event: &StreamEvent) -> IoResult<()> {
        writeln!(self.handle, "{event}")?;
        self.handle.flush()
    }

    fn name(&self) -> String {
        "StdOutSink".to_string()
    }
}

/// In-memory sink for tests and snapshots.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<StreamEvent>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of all captured events.
    #[must_use]
    pub fn snapshot(&self) -> Vec<StreamEvent> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn handle(&mut self, event: &StreamEvent) -> IoResult<()> {
        self.entries.lock().push(event.clone());
        Ok(())
    }

    fn name(&self) -> String {
        "MemorySink".to_string()
    }
}

/// Forwards events to a flume channel for async consumers (SSE bridges,
/// dashboards, test harnesses).
pub struct ChannelSink {
    tx: flume::Sender<StreamEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: flume::Sender<StreamEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn handle(&mut self, event: &StreamEvent) -> IoResult<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel receiver dropped"))
    }

    fn name(&self) -> String {
        "ChannelSink".to_string()
    }
}
