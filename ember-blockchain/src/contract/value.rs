//! Tagged stack values for the contract VM

use serde::{Deserialize, Serialize};

use super::vm::VmError;

/// A dynamically typed value on the VM stack or in contract storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Integer(i64),
    Text(String),
    Boolean(bool),
    Address(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Text(_) => "string",
            Value::Boolean(_) => "boolean",
            Value::Address(_) => "address",
            Value::Bytes(_) => "bytes",
        }
    }

    pub fn as_integer(&self) -> Result<i64, VmError> {
        match self {
            Value::Integer(v) => Ok(*v),
            other => Err(VmError::TypeMismatch {
                expected: "integer",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_boolean(&self) -> Result<bool, VmError> {
        match self {
            Value::Boolean(v) => Ok(*v),
            other => Err(VmError::TypeMismatch {
                expected: "boolean",
                found: other.type_name(),
            }),
        }
    }

    /// Render the value as a string; every variant has a string form
    pub fn as_string(&self) -> String {
        match self {
            Value::Integer(v) => v.to_string(),
            Value::Text(v) => v.clone(),
            Value::Boolean(v) => v.to_string(),
            Value::Address(v) => v.clone(),
            Value::Bytes(v) => hex::encode(v),
        }
    }

    /// Truthiness used by ASSERT
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Integer(v) => *v != 0,
            Value::Text(v) => !v.is_empty(),
            Value::Boolean(v) => *v,
            Value::Address(v) => !v.is_empty(),
            Value::Bytes(v) => !v.is_empty(),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Integer(0)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}
