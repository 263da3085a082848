use serde_json::Value;

use super::Reducer;

/// Adds numeric writes together. Integer arithmetic is used while both
/// sides are integers; anything else falls back to floats. A non-numeric
/// side is treated as absent, so the other side wins.
#[derive(Clone, Copy, Debug, Default)]
pub struct SumNumbers;

impl Reducer for SumNumbers {
    fn name(&self) -> &'static str {
        "sum_numbers"
    }

    fn apply(&self, current: Value, update: Value) -> Value {
        match (&current, &update) {
            (Value::Number(a), Value::Number(b)) => {
                if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                    Value::from(a + b)
                } else {
                    Value::from(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))
                }
            }
            (Value::Number(_), _) => current,
            _ => update,
        }
    }
}

/// Appends writes onto a growing list. Array updates are spliced in,
/// scalar updates are pushed; a non-array accumulator is coerced to a
/// single-element list first (`null` to an empty one).
#[derive(Clone, Copy, Debug, Default)]
pub struct AppendItems;

fn into_items(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

impl Reducer for AppendItems {
    fn name(&self) -> &'static str {
        "append_items"
    }

    fn apply(&self, current: Value, update: Value) -> Value {
        let mut items = into_items(current);
        items.extend(into_items(update));
        Value::Array(items)
    }
}

/// Shallow JSON-object merge: update keys overwrite accumulator keys.
/// A non-object update replaces the accumulator wholesale.
#[derive(Clone, Copy, Debug, Default)]
pub struct MapMerge;

impl Reducer for MapMerge {
    fn name(&self) -> &'static str {
        "map_merge"
    }

    fn apply(&self, current: Value, update: Value) -> Value {
        match (current, update) {
            (Value::Object(mut base), Value::Object(incoming)) => {
                for (key, value) in incoming {
                    base.insert(key, value);
                }
                Value::Object(base)
            }
            (current, Value::Null) => current,
            (Value::Null, update) => update,
            (_, Value::Object(incoming)) => Value::Object(incoming),
            (_, update) => update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sum_integers_stays_integer() {
        assert_eq!(SumNumbers.apply(json!(2), json!(3)), json!(5));
    }

    #[test]
    fn sum_mixed_falls_back_to_float() {
        assert_eq!(SumNumbers.apply(json!(1), json!(0.5)), json!(1.5));
    }

    #[test]
    fn append_splices_arrays() {
        assert_eq!(
            AppendItems.apply(json!([1]), json!([2, 3])),
            json!([1, 2, 3])
        );
        assert_eq!(AppendItems.apply(json!(null), json!("x")), json!(["x"]));
    }

    #[test]
    fn map_merge_is_shallow() {
        let merged = MapMerge.apply(
            json!({"a": 1, "nested": {"x": 1}}),
            json!({"b": 2, "nested": {"y": 2}}),
        );
        assert_eq!(merged, json!({"a": 1, "b": 2, "nested": {"y": 2}}));
    }
}
