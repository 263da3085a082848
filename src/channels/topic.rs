use serde_json::{Value, json};

use super::{Channel, ChannelError};

/// Ordered multiset of values.
///
/// Writes may be nested one level: array writes are flattened into their
/// elements, everything else is appended as-is. Insertion order within a
/// step is preserved.
///
/// Flags:
/// - `unique`: incoming values already seen (by value equality) are
///   dropped. The seen-set persists across steps and restarts.
/// - `accumulate`: content carries across steps; without it, every step
///   starts from an empty list and a step with no writes leaves the
///   channel empty.
#[derive(Clone, Debug)]
pub struct Topic {
    unique: bool,
    accumulate: bool,
    seen: Vec<Value>,
    values: Vec<Value>,
}

impl Topic {
    #[must_use]
    pub fn new(unique: bool, accumulate: bool) -> Self {
        Self {
            unique,
            accumulate,
            seen: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Restore from a `[seen, values]` snapshot produced by
    /// [`Channel::checkpoint`].
    pub fn from_checkpoint(
        unique: bool,
        accumulate: bool,
        snapshot: Value,
    ) -> Result<Self, ChannelError> {
        let Value::Array(mut parts) = snapshot else {
            return Err(ChannelError::invalid_update(
                "Topic snapshot must be a [seen, values] pair",
            ));
        };
        if parts.len() != 2 {
            return Err(ChannelError::invalid_update(
                "Topic snapshot must be a [seen, values] pair",
            ));
        }
        let values = match parts.pop() {
            Some(Value::Array(v)) => v,
            _ => {
                return Err(ChannelError::invalid_update(
                    "Topic snapshot values must be an array",
                ));
            }
        };
        let seen = match parts.pop() {
            Some(Value::Array(v)) => v,
            _ => {
                return Err(ChannelError::invalid_update(
                    "Topic snapshot seen-set must be an array",
                ));
            }
        };
        Ok(Self {
            unique,
            accumulate,
            seen,
            values,
        })
    }

    fn flatten(writes: Vec<Value>) -> Vec<Value> {
        let mut out = Vec::with_capacity(writes.len());
        for write in writes {
            match write {
                Value::Array(items) => out.extend(items),
                other => out.push(other),
            }
        }
        out
    }
}

impl Channel for Topic {
    fn update(&mut self, writes: Vec<Value>) -> Result<bool, ChannelError> {
        let mut incoming = Self::flatten(writes);
        if self.unique {
            let seen = &mut self.seen;
            incoming.retain(|v| {
                if seen.contains(v) {
                    false
                } else {
                    seen.push(v.clone());
                    true
                }
            });
        }
        if self.accumulate {
            let changed = !incoming.is_empty();
            self.values.extend(incoming);
            Ok(changed)
        } else {
            let changed = !incoming.is_empty() || !self.values.is_empty();
            self.values = incoming;
            Ok(changed)
        }
    }

    fn get(&self) -> Result<Value, ChannelError> {
        if !self.accumulate && self.values.is_empty() {
            return Err(ChannelError::EmptyChannel);
        }
        Ok(Value::Array(self.values.clone()))
    }

    fn is_available(&self) -> bool {
        self.accumulate || !self.values.is_empty()
    }

    fn consume(&mut self) -> bool {
        false
    }

    fn checkpoint(&self) -> Result<Value, ChannelError> {
        Ok(json!([self.seen, self.values]))
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}
