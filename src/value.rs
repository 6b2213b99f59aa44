// File: src/value.rs
//
// Runtime values for the SANVM stack machine.
// One tagged sum covers everything the operand stack, variable storage,
// and inline bytecode operands can hold.

use crate::errors::VmError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A value carried on the operand stack and in storage.
///
/// `Label` is transient compiler output: it only exists between the Pena
/// compiler emitting a jump target and label fix-up rewriting it to a
/// concrete address. Deserialization never produces it (`Str` is tried
/// first), and serializing one degrades to its plain string form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Str(String),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    Label(String),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn empty_list() -> Self {
        Value::List(Vec::new())
    }

    pub fn empty_dict() -> Self {
        Value::Dict(BTreeMap::new())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness for the boolean opcodes: only the integer zero is false.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Int(0))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Label(_) => "label",
        }
    }

    /// Converts a JSON operand into a runtime value. Floats, booleans, and
    /// nulls have no stack representation and are rejected.
    pub fn from_json(json: &serde_json::Value) -> Result<Value, VmError> {
        match json {
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| VmError::value_error(format!("unsupported numeric operand: {n}"))),
            serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
            serde_json::Value::Array(items) => items
                .iter()
                .map(Value::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            serde_json::Value::Object(map) => {
                let mut dict = BTreeMap::new();
                for (key, value) in map {
                    dict.insert(key.clone(), Value::from_json(value)?);
                }
                Ok(Value::Dict(dict))
            }
            other => Err(VmError::value_error(format!("unsupported operand: {other}"))),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Str(s) | Value::Label(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Dict(map) => {
                let mut object = serde_json::Map::new();
                for (key, value) in map {
                    object.insert(key.clone(), value.to_json());
                }
                serde_json::Value::Object(object)
            }
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) | Value::Label(s) => write!(f, "{s}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Dict(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_accessors() {
        assert_eq!(Value::Int(7).as_int(), Some(7));
        assert_eq!(Value::str("x").as_int(), None);
        assert_eq!(Value::str("x").as_str(), Some("x"));
        assert_eq!(Value::Int(7).as_str(), None);
    }

    #[test]
    fn test_truthiness_is_nonzero() {
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Int(-3).is_truthy());
        assert!(Value::str("").is_truthy());
        assert!(Value::empty_list().is_truthy());
    }

    #[test]
    fn test_display_formats_containers() {
        let list = Value::List(vec![Value::Int(1), Value::str("a")]);
        assert_eq!(list.to_string(), "[1, a]");

        let mut map = BTreeMap::new();
        map.insert("k".to_string(), Value::Int(2));
        assert_eq!(Value::Dict(map).to_string(), "{k: 2}");
    }

    #[test]
    fn test_json_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("xs".to_string(), Value::List(vec![Value::Int(1), Value::Int(2)]));
        map.insert("name".to_string(), Value::str("pena"));
        let value = Value::Dict(map);

        let back = Value::from_json(&value.to_json()).expect("round trip");
        assert_eq!(back, value);
    }

    #[test]
    fn test_from_json_rejects_floats() {
        let json: serde_json::Value = serde_json::from_str("1.5").expect("valid json");
        assert!(Value::from_json(&json).is_err());
    }

    #[test]
    fn test_serde_never_deserializes_labels() {
        let value: Value = serde_json::from_str("\"LABEL_1\"").expect("valid json");
        assert_eq!(value, Value::str("LABEL_1"));
    }
}
