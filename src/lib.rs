//! # Stategraph: a runtime for stateful, cyclic computation graphs
//!
//! Stategraph executes graphs of named nodes that read and write named
//! **channels**. Execution proceeds in discrete **supersteps**: the engine
//! prepares the set of eligible tasks from the current checkpoint, runs
//! them concurrently, merges their writes through each channel's reducer
//! semantics, and commits a new checkpoint — until no node is eligible.
//! Every checkpoint is durable, so a run can be paused on an interrupt,
//! resumed, rewound to an earlier step, or forked into a new branch.
//!
//! ## Core concepts
//!
//! - **Channels** ([`channels`]): typed accumulators defining how
//!   concurrent writes merge within one step.
//! - **Nodes** ([`node`]): units of computation triggered by channel
//!   version bumps, bound to an async [`node::NodeRunner`].
//! - **Checkpoints** ([`checkpoint`]): immutable snapshots persisted
//!   through the [`checkpoint::CheckpointSaver`] contract.
//! - **The loop** ([`pregel`]): the superstep scheduler with interrupts,
//!   resume, retries, caching, and cancellation.
//! - **Events** ([`event_bus`]): streaming fan-out of run events.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde_json::{Value, json};
//! use stategraph::channels::ChannelSpec;
//! use stategraph::config::RunConfig;
//! use stategraph::node::{NodeContext, NodeError, NodeRunner, NodeUpdate, PregelNode};
//! use stategraph::pregel::{GraphInput, Pregel};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl NodeRunner for Echo {
//!     async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeUpdate, NodeError> {
//!         Ok(NodeUpdate::write("output", json!(format!("echo: {input}"))))
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let graph = Pregel::builder()
//!     .add_channel("input", ChannelSpec::LastValue)
//!     .add_channel("output", ChannelSpec::LastValue)
//!     .add_node(
//!         PregelNode::new("echo", Arc::new(Echo))
//!             .with_triggers(["input"])
//!             .with_channels(["input"]),
//!     )
//!     .build()?;
//!
//! let output = graph
//!     .invoke(
//!         GraphInput::values([("input", json!("hi"))]),
//!         RunConfig::default(),
//!     )
//!     .await?;
//! assert_eq!(output.values["output"], json!("echo: hi"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Durability & resume
//!
//! Attach a [`checkpoint::CheckpointSaver`] and address runs by thread:
//! the engine persists a checkpoint at every step and each task's writes
//! the moment the task completes. Re-invoking the same thread with
//! [`pregel::GraphInput::Null`] resumes from whatever was persisted;
//! tasks whose deterministic ids already have recorded writes replay
//! instead of re-executing. Human-in-the-loop pauses use
//! [`node::NodeContext::interrupt`] and resume with
//! [`types::Command::resume`].

pub mod channels;
pub mod checkpoint;
pub mod config;
pub mod event_bus;
pub mod node;
pub mod pregel;
pub mod reducers;
pub mod telemetry;
pub mod types;
