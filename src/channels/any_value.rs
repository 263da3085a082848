use serde_json::Value;

use super::{Channel, ChannelError};

/// Stores the last value written; multiple writes per step are allowed and
/// the last one wins.
#[derive(Clone, Debug, Default)]
pub struct AnyValue {
    value: Option<Value>,
}

impl AnyValue {
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

impl Channel for AnyValue {
    fn update(&mut self, mut writes: Vec<Value>) -> Result<bool, ChannelError> {
        match writes.pop() {
            Some(last) => {
                self.value = Some(last);
                Ok(true)
            }
            None => Ok(false),
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_write_wins() {
        let mut ch = AnyValue::new();
        assert!(ch.update(vec![json!(1), json!(2), json!(3)]).unwrap());
        assert_eq!(ch.get().unwrap(), json!(3));
    }

    #[test]
    fn empty_until_written() {
        let ch = AnyValue::new();
        assert!(!ch.is_available());
    }
}
