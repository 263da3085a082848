//! Best-effort observability fan-out for run events.
//!
//! The module is organised around a broadcast-based [`EventHub`] with
//! pluggable [`EventSink`]s (`EventBus`) and subscriber handles
//! ([`EventStream`]). Every run event passes through the bus regardless of
//! stream-mode selection; sinks are for logs, dashboards, and tests.
//!
//! The *run stream* returned by [`crate::pregel::Pregel::stream`] is a
//! separate, bounded channel whose delivery the loop awaits — use that
//! (not a sink) when the consumer must be able to backpressure the run.

mod bus;
mod event;
mod sink;

pub use bus::{EmitterError, EventBus, EventEmitter, EventHub, EventHubMetrics, EventStream};
pub use event::{StreamEvent, TaskEvent, TaskPhase};
pub use sink::{ChannelSink, EventSink, MemorySink, StdOutSink};
