//! Structural diff of two JSON mappings.
//!
//! Leaves are compared with exact equality, so floats that differ only by
//! rounding are reported as changed.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// How a key present on both sides differs
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Leaf values (or a mapping on only one side) differ
    Value { a: Value, b: Value },
    /// Both sides hold mappings; their diff
    Nested(Box<DiffResult>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffResult {
    pub label_a: String,
    pub label_b: String,
    /// Keys present only on side B
    pub added: BTreeMap<String, Value>,
    /// Keys present only on side A
    pub removed: BTreeMap<String, Value>,
    pub changed: BTreeMap<String, Change>,
}

impl DiffResult {
    /// Diff `a` against `b` over the union of their keys, recursing into
    /// mappings present on both sides.
    pub fn between(
        a: &Map<String, Value>,
        b: &Map<String, Value>,
        label_a: &str,
        label_b: &str,
    ) -> Self {
        let mut result = Self {
            label_a: label_a.to_string(),
            label_b: label_b.to_string(),
            added: BTreeMap::new(),
            removed: BTreeMap::new(),
            changed: BTreeMap::new(),
        };

        for (key, value_a) in a {
            match (value_a, b.get(key)) {
                (_, None) => {
                    result.removed.insert(key.clone(), value_a.clone());
                }
                (_, Some(value_b)) if value_a == value_b => {}
                (Value::Object(map_a), Some(Value::Object(map_b))) => {
                    let nested = Self::between(map_a, map_b, label_a, label_b);
                    result
                        .changed
                        .insert(key.clone(), Change::Nested(Box::new(nested)));
                }
                (_, Some(value_b)) => {
                    result.changed.insert(
                        key.clone(),
                        Change::Value {
                            a: value_a.clone(),
                            b: value_b.clone(),
                        },
                    );
                }
            }
        }

        for (key, value_b) in b {
            if !a.contains_key(key) {
                result.added.insert(key.clone(), value_b.clone());
            }
        }

        result
    }

    /// Diff two values that are expected to be mappings; non-mapping input
    /// is treated as an empty mapping.
    pub fn between_values(a: &Value, b: &Value, label_a: &str, label_b: &str) -> Self {
        let empty = Map::new();
        Self::between(
            a.as_object().unwrap_or(&empty),
            b.as_object().unwrap_or(&empty),
            label_a,
            label_b,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// `{added, removed, changed}` with changed leaves keyed by side label.
    pub fn to_json(&self) -> Value {
        let (key_a, key_b) = if self.label_a == self.label_b {
            (format!("{} (a)", self.label_a), format!("{} (b)", self.label_b))
        } else {
            (self.label_a.clone(), self.label_b.clone())
        };

        let changed: Map<String, Value> = self
            .changed
            .iter()
            .map(|(key, change)| {
                let rendered = match change {
                    Change::Value { a, b } => {
                        let mut sides = Map::new();
                        sides.insert(key_a.clone(), a.clone());
                        sides.insert(key_b.clone(), b.clone());
                        Value::Object(sides)
                    }
                    Change::Nested(nested) => nested.to_json(),
                };
                (key.clone(), rendered)
            })
            .collect();

        let to_map = |m: &BTreeMap<String, Value>| -> Value {
            Value::Object(m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        };

        serde_json::json!({
            "added": to_map(&self.added),
            "removed": to_map(&self.removed),
            "changed": Value::Object(changed),
        })
    }
}

impl Serialize for DiffResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
