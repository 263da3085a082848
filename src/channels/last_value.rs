use serde_json::Value;

use super::{Channel, ChannelError};

/// Stores the last value written, allowing at most one write per step.
///
/// Two writes to a `LastValue` channel in the same superstep is a graph
/// bug (two nodes racing on a scalar), so it fails with
/// [`ChannelError::InvalidUpdate`] rather than picking a winner.
#[derive(Clone, Debug, Default)]
pub struct LastValue {
    value: Option<Value>,
}

impl LastValue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_checkpoint(snapshot: Value) -> Self {
        Self {
            value: Some(snapshot),
        }
    }
}

impl Channel for LastValue {
    fn update(&mut self, mut writes: Vec<Value>) -> Result<bool, ChannelError> {
        match writes.len() {
            0 => Ok(false),
            1 => {
                self.value = writes.pop();
                Ok(true)
            }
            n => Err(ChannelError::invalid_update(format!(
                "LastValue accepts at most one write per step, got {n}"
            ))),
        }
    }

    fn get(&self) -> Result<Value, ChannelError> {
        self.value.clone().ok_or(ChannelError::EmptyChannel)
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn consume(&mut self) -> bool {
        false
    }

    fn checkpoint(&self) -> Result<Value, ChannelError> {
        self.value.clone().ok_or(ChannelError::EmptyChannel)
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}
