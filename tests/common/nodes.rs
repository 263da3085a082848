#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use stategraph::node::{NodeContext, NodeError, NodeRunner, NodeUpdate};
use stategraph::types::ChannelWrite;

/// Node that runs a synchronous closure over `(input, ctx)`.
pub struct FnNode<F>(pub F);

#[async_trait]
impl<F> NodeRunner for FnNode<F>
where
    F: Fn(Value, NodeContext) -> Result<NodeUpdate, NodeError> + Send + Sync,
{
    async fn run(&self, input: Value, ctx: NodeContext) -> Result<NodeUpdate, NodeError> {
        (self.0)(input, ctx)
    }
}

/// Bound computation that always produces the same writes.
pub fn fixed_writes<I, S>(entries: I) -> Arc<dyn NodeRunner>
where
    I: IntoIterator<Item = (S, Value)>,
    S: Into<String>,
{
    let writes: Vec<ChannelWrite> = entries
        .into_iter()
        .map(|(channel, value)| ChannelWrite::new(channel, value))
        .collect();
    Arc::new(FnNode(
        move |_input: Value, _ctx: NodeContext| -> Result<NodeUpdate, NodeError> {
            Ok(NodeUpdate::Writes(writes.clone()))
        },
    ))
}

/// Bound computation deriving writes from the input value.
pub fn from_input<F>(f: F) -> Arc<dyn NodeRunner>
where
    F: Fn(Value) -> Vec<(String, Value)> + Send + Sync + 'static,
{
    Arc::new(FnNode(
        move |input: Value, _ctx: NodeContext| -> Result<NodeUpdate, NodeError> {
            Ok(NodeUpdate::Writes(
                f(input)
                    .into_iter()
                    .map(|(channel, value)| ChannelWrite::new(channel, value))
                    .collect(),
            ))
        },
    ))
}

/// Node counting its executions before delegating to a closure.
pub struct CountingNode<F> {
    pub runs: Arc<AtomicUsize>,
    pub inner: F,
}

#[async_trait]
impl<F> NodeRunner for CountingNode<F>
where
    F: Fn(Value, NodeContext) -> Result<NodeUpdate, NodeError> + Send + Sync,
{
    async fn run(&self, input: Value, ctx: NodeContext) -> Result<NodeUpdate, NodeError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        (self.inner)(input, ctx)
    }
}

/// Node that fails a fixed number of times before succeeding.
pub struct FlakyNode {
    pub attempts: Arc<AtomicUsize>,
    pub failures_before_success: usize,
    pub writes: Vec<ChannelWrite>,
}

#[async_trait]
impl NodeRunner for FlakyNode {
    async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeUpdate, NodeError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures_before_success {
            Err(NodeError::Provider {
                provider: "test".to_string(),
                message: format!("transient failure #{attempt}"),
            })
        } else {
            Ok(NodeUpdate::Writes(self.writes.clone()))
        }
    }
}
