use serde_json::Value;

use super::{Channel, ChannelError};

/// Holds one value for a single step.
///
/// The value is cleared when a triggered node consumes it, and the
/// end-of-step idle notification (`update(vec![])`) clears any leftover
/// value so the channel never leaks state into a later step.
#[derive(Clone, Debug, Default)]
pub struct EphemeralValue {
    value: Option<Value>,
}

impl EphemeralValue {
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

impl Channel for EphemeralValue {
    fn update(&mut self, mut writes: Vec<Value>) -> Result<bool, ChannelError> {
        match writes.len() {
            0 => Ok(self.value.take().is_some()),
            1 => {
                self.value = writes.pop();
                Ok(true)
            }
            n => Err(ChannelError::invalid_update(format!(
                "EphemeralValue accepts at most one write per step, got {n}"
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
        self.value.take().is_some()
    }

    fn checkpoint(&self) -> Result<Value, ChannelError> {
        self.value.clone().ok_or(ChannelError::EmptyChannel)
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn consume_clears_value() {
        let mut ch = EphemeralValue::new();
        ch.update(vec![json!("x")]).unwrap();
        assert!(ch.consume());
        assert!(!ch.is_available());
        assert!(!ch.consume());
    }

    #[test]
    fn idle_step_clears_leftover() {
        let mut ch = EphemeralValue::new();
        ch.update(vec![json!(1)]).unwrap();
        assert!(ch.update(vec![]).unwrap());
        assert!(matches!(ch.get(), Err(ChannelError::EmptyChannel)));
        assert!(!ch.update(vec![]).unwrap());
    }
}
