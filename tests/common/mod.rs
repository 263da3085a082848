pub mod nodes;

pub use nodes::*;

use std::sync::Arc;

use serde_json::json;
use stategraph::channels::ChannelSpec;
use stategraph::checkpoint::CheckpointSaver;
use stategraph::node::PregelNode;
use stategraph::pregel::{Pregel, PregelBuilder};
use stategraph::reducers::SumNumbers;

/// Fan-out/sum graph used across suites: `fan` fires once off the `start`
/// channel and seeds the `xs` topic, `sum` folds every `xs` change into a
/// running total.
pub fn sum_graph(saver: Option<Arc<dyn CheckpointSaver>>) -> Pregel {
    let mut builder = Pregel::builder()
        .add_channel("start", ChannelSpec::EphemeralValue)
        .add_channel(
            "xs",
            ChannelSpec::Topic {
                unique: false,
                accumulate: false,
            },
        )
        .add_channel(
            "total",
            ChannelSpec::binary_operator(Arc::new(SumNumbers), json!(0)),
        )
        .add_node(
            PregelNode::new("fan", fixed_writes([("xs", json!([1, 2, 3]))]))
                .with_triggers(["start"])
                .with_channels(["start"]),
        )
        .add_node(
            PregelNode::new(
                "sum",
                from_input(|input| {
                    let total: i64 = input
                        .as_array()
                        .map(|xs| xs.iter().filter_map(|v| v.as_i64()).sum())
                        .unwrap_or(0);
                    vec![("total".to_string(), json!(total))]
                }),
            )
            .with_triggers(["xs"])
            .with_channels(["xs"]),
        );
    if let Some(saver) = saver {
        builder = builder.with_saver(saver);
    }
    builder.build().expect("sum graph builds")
}

/// Two-channel pipeline scaffold used when a test mostly needs channels.
pub fn last_value_graph() -> PregelBuilder {
    Pregel::builder()
        .add_channel("input", ChannelSpec::LastValue)
        .add_channel("output", ChannelSpec::LastValue)
}
