//! Runtime type names for field declarations.
//!
//! `ValueType` is what a declaration file writes in a field's `types` list.
//! Each [`crate::Value`] variant maps to exactly one concrete type; `Number`
//! is the only umbrella type and accepts both integers and floats.

use serde::{Deserialize, Serialize};

use crate::values::Value;

/// Runtime type accepted by a [`crate::FieldSpec`].
///
/// # YAML Format
///
/// ```yaml
/// types: [number]
/// types: [text, "null"]
/// types: [timestamp]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// Explicit null; list it to make an optional field nullable
    #[serde(alias = "none")]
    Null,
    /// Boolean value
    Bool,
    /// 64-bit signed integer
    #[serde(alias = "integer")]
    Int,
    /// 64-bit floating point
    Float,
    /// Either an integer or a float
    Number,
    /// UTF-8 string
    #[serde(alias = "str", alias = "string")]
    Text,
    /// UTC timestamp
    #[serde(alias = "datetime", alias = "date")]
    Timestamp,
}

impl ValueType {
    /// Whether `value` is an instance of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::Null, Value::Null)
                | (Self::Bool, Value::Bool(_))
                | (Self::Int, Value::Int(_))
                | (Self::Float, Value::Float(_))
                | (Self::Number, Value::Int(_) | Value::Float(_))
                | (Self::Text, Value::Text(_))
                | (Self::Timestamp, Value::Timestamp(_))
        )
    }

    /// The concrete type of `value`.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Int(_) => Self::Int,
            Value::Float(_) => Self::Float,
            Value::Text(_) => Self::Text,
            Value::Timestamp(_) => Self::Timestamp,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Number => "number",
            Self::Text => "text",
            Self::Timestamp => "timestamp",
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_number_accepts_int_and_float() {
        assert!(ValueType::Number.accepts(&Value::Int(1)));
        assert!(ValueType::Number.accepts(&Value::Float(1.5)));
        assert!(!ValueType::Number.accepts(&Value::Text("1".to_string())));
        assert!(!ValueType::Int.accepts(&Value::Float(1.0)));
    }

    #[test]
    fn test_of_is_accepted_by_itself() {
        let ts = Utc.with_ymd_and_hms(2021, 6, 30, 0, 0, 0).unwrap();
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Int(3),
            Value::Float(0.5),
            Value::Text("x".to_string()),
            Value::Timestamp(ts),
        ] {
            assert!(ValueType::of(&value).accepts(&value));
        }
    }

    #[test]
    fn test_yaml_aliases() {
        let parsed: Vec<ValueType> =
            serde_yaml::from_str("[none, str, datetime, integer, number]").unwrap();
        assert_eq!(
            parsed,
            vec![
                ValueType::Null,
                ValueType::Text,
                ValueType::Timestamp,
                ValueType::Int,
                ValueType::Number
            ]
        );
        assert!(serde_yaml::from_str::<ValueType>("decimal").is_err());
    }
}
