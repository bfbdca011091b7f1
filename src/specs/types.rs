//! Value types and labels for message properties.
//!
//! Every property in a parameter map carries a wire type and a label.
//! The codec layer uses these to validate decoded values and to decide
//! how a property is emitted on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Wire type of a single property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Type {
    #[default]
    String,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Float,
    Double,
    Bool,
    Bytes,
    Message,
    Enum,
}

impl Type {
    pub fn as_str(&self) -> &'static str {
        match self {
            Type::String => "string",
            Type::Int32 => "int32",
            Type::Int64 => "int64",
            Type::Uint32 => "uint32",
            Type::Uint64 => "uint64",
            Type::Float => "float",
            Type::Double => "double",
            Type::Bool => "bool",
            Type::Bytes => "bytes",
            Type::Message => "message",
            Type::Enum => "enum",
        }
    }

    /// Infers the wire type for a default value.
    pub fn infer(value: &Value) -> Option<Type> {
        match value {
            Value::String(_) => Some(Type::String),
            Value::Bool(_) => Some(Type::Bool),
            Value::Number(number) => {
                if number.is_f64() {
                    Some(Type::Double)
                } else {
                    Some(Type::Int64)
                }
            }
            _ => None,
        }
    }

    /// Reports whether the given decoded value is acceptable for this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Type::String | Type::Bytes => value.is_string(),
            Type::Bool => value.is_boolean(),
            Type::Int32 => value
                .as_i64()
                .is_some_and(|v| i32::try_from(v).is_ok()),
            Type::Int64 => value.as_i64().is_some(),
            Type::Uint32 => value
                .as_u64()
                .is_some_and(|v| u32::try_from(v).is_ok()),
            Type::Uint64 => value.as_u64().is_some(),
            Type::Float | Type::Double => value.as_f64().is_some(),
            // Enums come in as symbolic names on the wire
            Type::Enum => value.is_string(),
            Type::Message => value.is_object(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cardinality label of a property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    #[default]
    Optional,
    Required,
    Repeated,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Label::Optional => "optional",
            Label::Required => "required",
            Label::Repeated => "repeated",
        };

        f.write_str(label)
    }
}

/// Describes the JSON kind of a decoded value, used in codec mismatch reports.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
