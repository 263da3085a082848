use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{
    broadcast::{self, Receiver, Sender},
    oneshot,
};
use tokio::time::timeout;

use super::event::StreamEvent;
use super::sink::EventSink;

const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Errors that can occur when emitting an event.
#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("event hub closed")]
    Closed,
}

/// Abstract event emitter the runtime threads through task contexts.
pub trait EventEmitter: Send + Sync + fmt::Debug {
    /// Emit an event in a synchronous, non-blocking manner.
    fn emit(&self, event: StreamEvent) -> Result<(), EmitterError>;
}

/// Snapshot of hub health for monitoring and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHubMetrics {
    /// Events buffered per subscriber before lag drops occur.
    pub capacity: usize,
    /// Total events dropped due to slow subscribers.
    pub dropped: usize,
}

/// Broadcast core shared by the bus, its sinks, and subscribers.
#[derive(Debug)]
pub struct EventHub {
    sender: RwLock<Option<Sender<StreamEvent>>>,
    dropped: AtomicUsize,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Arc::new(Self {
            sender: RwLock::new(Some(sender)),
            dropped: AtomicUsize::new(0),
            capacity,
        })
    }

    /// Publish to all subscribers. Fails once the hub is closed or when no
    /// subscriber exists — callers treat both as "nobody is listening".
    pub fn publish(&self, event: StreamEvent) -> Result<(), EmitterError> {
        let sender = self.sender.read().clone();
        match sender {
            Some(sender) => sender.send(event).map(|_| ()).map_err(|_| EmitterError::Closed),
            None => Err(EmitterError::Closed),
        }
    }

    pub fn subscribe(self: &Arc<Self>) -> EventStream {
        let receiver = match self.sender.read().as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                // Closed hub: hand back a receiver that reports Closed.
                let (sender, receiver) = broadcast::channel(1);
                drop(sender);
                receiver
            }
        };
        EventStream {
            receiver,
            hub: Arc::clone(self),
        }
    }

    pub fn emitter(self: &Arc<Self>) -> HubEmitter {
        HubEmitter {
            hub: Arc::clone(self),
        }
    }

    /// Close the hub: subscribers drain buffered events, then end.
    pub fn close(&self) {
        let _ = self.sender.write().take();
    }

    pub fn metrics(&self) -> EventHubMetrics {
        EventHubMetrics {
            capacity: self.capacity,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn record_lag(&self, missed: u64) {
        let missed = usize::try_from(missed).unwrap_or(usize::MAX);
        let total = self
            .dropped
            .fetch_add(missed, Ordering::Relaxed)
            .saturating_add(missed);
        tracing::warn!(
            target: "stategraph::event_bus",
            missed,
            total_dropped = total,
            "event stream lagged; dropped events"
        );
    }
}

/// Emitter handle bound to one hub.
#[derive(Clone, Debug)]
pub struct HubEmitter {
    hub: Arc<EventHub>,
}

impl EventEmitter for HubEmitter {
    fn emit(&self, event: StreamEvent) -> Result<(), EmitterError> {
        self.hub.publish(event)
    }
}

/// Subscriber handle over the hub's broadcast channel.
#[derive(Debug)]
pub struct EventStream {
    receiver: Receiver<StreamEvent>,
    hub: Arc<EventHub>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Result<StreamEvent, broadcast::error::RecvError> {
        match self.receiver.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                self.hub.record_lag(missed);
                Err(broadcast::error::RecvError::Lagged(missed))
            }
            other => other,
        }
    }

    pub fn try_recv(&mut self) -> Result<StreamEvent, broadcast::error::TryRecvError> {
        match self.receiver.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                self.hub.record_lag(missed);
                Err(broadcast::error::TryRecvError::Lagged(missed))
            }
            other => other,
        }
    }

    /// Next event within `duration`, skipping over lag notifications.
    pub async fn next_timeout(&mut self, duration: Duration) -> Option<StreamEvent> {
        loop {
            match timeout(duration, self.recv()).await {
                Ok(Ok(event)) => return Some(event),
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
            }
        }
    }

    /// Adapt into a boxed `Stream` for combinator pipelines.
    pub fn into_async_stream(self) -> BoxStream<'static, StreamEvent> {
        stream::unfold(self, |mut this| async move {
            loop {
                match this.recv().await {
                    Ok(event) => return Some((event, this)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

/// Event fan-out with pluggable sinks.
///
/// Each sink runs on its own worker task subscribed to the hub, so a slow
/// sink lags (and drops) rather than stalling the run.
pub struct EventBus {
    hub: Arc<EventHub>,
    sinks: Mutex<Vec<SinkEntry>>,
    started: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sinks(Vec::new())
    }
}

impl EventBus {
    pub fn with_sink<T: EventSink + 'static>(sink: T) -> Self {
        Self::with_sinks(vec![Box::new(sink)])
    }

    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self::with_capacity(sinks, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(sinks: Vec<Box<dyn EventSink>>, buffer_capacity: usize) -> Self {
        Self {
            hub: EventHub::new(buffer_capacity),
            sinks: Mutex::new(sinks.into_iter().map(SinkEntry::new).collect()),
            started: AtomicBool::new(false),
        }
    }

    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        let mut entry = SinkEntry::new(Box::new(sink));
        if self.started.load(Ordering::SeqCst) {
            entry.spawn(Arc::clone(&self.hub));
        }
        self.sinks.lock().push(entry);
    }

    pub fn emitter(&self) -> Arc<dyn EventEmitter> {
        Arc::new(self.hub.emitter())
    }

    pub fn subscribe(&self) -> EventStream {
        self.hub.subscribe()
    }

    pub fn metrics(&self) -> EventHubMetrics {
        self.hub.metrics()
    }

    /// Start the sink workers. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.sinks.lock().iter_mut() {
            entry.spawn(Arc::clone(&self.hub));
        }
    }

    /// Stop sink workers and close the hub.
    pub async fn shutdown(&self) {
        self.hub.close();
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let workers: Vec<SinkWorker> = {
            let mut sinks = self.sinks.lock();
            sinks.iter_mut().filter_map(|entry| entry.worker.take()).collect()
        };
        for worker in workers {
            let _ = worker.shutdown.send(());
            let _ = worker.handle.await;
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

struct SinkEntry {
    sink: Arc<Mutex<Box<dyn EventSink>>>,
    worker: Option<SinkWorker>,
}

struct SinkWorker {
    shutdown: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl SinkEntry {
    fn new(sink: Box<dyn EventSink>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            worker: None,
        }
    }

    fn spawn(&mut self, hub: Arc<EventHub>) {
        if self.worker.is_some() {
            return;
        }
        let sink = Arc::clone(&self.sink);
        let mut stream = hub.subscribe();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    event = stream.recv() => match event {
                        Ok(event) => {
                            let mut guard = sink.lock();
                            if let Err(err) = guard.handle(&event) {
                                tracing::warn!(sink = %guard.name(), %err, "event sink error");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        });
        self.worker = Some(SinkWorker {
            shutdown: shutdown_tx,
            handle,
        });
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) {
            for entry in self.sinks.lock().iter_mut() {
                if let Some(worker) = entry.worker.take() {
                    let _ = worker.shutdown.send(());
                    worker.handle.abort();
                }
            }
        }
    }
}
