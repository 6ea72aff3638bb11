//! Argument codec for values that JSON cannot carry on its own.
//!
//! The codec is deliberately narrow: undefined, null, booleans, finite numbers,
//! strings and errors. Anything else is rejected; widening the set is a
//! decision for the consumer that needs it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ArgumentError, RemoteError};

/// A JSON primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Primitive {
    Boolean(bool),
    Number(f64),
    String(String),
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

/// In-memory value accepted by the codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Undefined,
    Null,
    Primitive(Primitive),
    Error(RemoteError),
}

impl Argument {
    /// Convert a JSON value, rejecting arrays and objects.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ArgumentError> {
        use serde_json::Value;

        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Primitive(Primitive::Boolean(b))),
            Value::Number(n) => n
                .as_f64()
                .map(|n| Self::Primitive(Primitive::Number(n)))
                .ok_or_else(|| ArgumentError::unsupported("number", &n)),
            Value::String(s) => Ok(Self::Primitive(Primitive::String(s))),
            Value::Array(_) => Err(ArgumentError::unsupported("array", &value)),
            Value::Object(_) => Err(ArgumentError::unsupported("object", &value)),
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }
}

impl From<bool> for Argument {
    fn from(value: bool) -> Self {
        Self::Primitive(Primitive::Boolean(value))
    }
}

impl From<f64> for Argument {
    fn from(value: f64) -> Self {
        Self::Primitive(Primitive::Number(value))
    }
}

impl From<&str> for Argument {
    fn from(value: &str) -> Self {
        Self::Primitive(Primitive::String(value.to_string()))
    }
}

impl From<String> for Argument {
    fn from(value: String) -> Self {
        Self::Primitive(Primitive::String(value))
    }
}

impl From<RemoteError> for Argument {
    fn from(value: RemoteError) -> Self {
        Self::Error(value)
    }
}

impl From<Option<RemoteError>> for Argument {
    fn from(value: Option<RemoteError>) -> Self {
        value.map_or(Self::Undefined, Self::Error)
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Primitive(p) => write!(f, "{p}"),
            Self::Error(e) => write!(f, "Error: {}", e.message),
        }
    }
}

/// Wire form of an [`Argument`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SerializedArgument {
    Undefined,
    Null,
    Primitive {
        value: Primitive,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    /// Any tag this build does not know about.
    #[serde(untagged)]
    Unrecognized {
        #[serde(rename = "type")]
        tag: String,
    },
}

impl SerializedArgument {
    pub fn undefined() -> Self {
        Self::Undefined
    }
}

pub fn serialize(value: &Argument) -> Result<SerializedArgument, ArgumentError> {
    Ok(match value {
        Argument::Undefined => SerializedArgument::Undefined,
        Argument::Null => SerializedArgument::Null,
        Argument::Primitive(Primitive::Number(n)) if !n.is_finite() => {
            return Err(ArgumentError::unsupported("number", n));
        }
        Argument::Primitive(p) => SerializedArgument::Primitive { value: p.clone() },
        Argument::Error(e) => SerializedArgument::Error {
            message: e.message.clone(),
            stack: e.stack.clone(),
        },
    })
}

pub fn deserialize(value: SerializedArgument) -> Result<Argument, ArgumentError> {
    match value {
        SerializedArgument::Undefined => Ok(Argument::Undefined),
        SerializedArgument::Null => Ok(Argument::Null),
        SerializedArgument::Primitive { value } => Ok(Argument::Primitive(value)),
        SerializedArgument::Error { message, stack } => {
            Ok(Argument::Error(RemoteError { message, stack }))
        }
        SerializedArgument::Unrecognized { tag } => Err(ArgumentError::UnknownArgumentTag { tag }),
    }
}

/// Serialize the failure of a work function.
pub fn serialize_error(error: &anyhow::Error) -> SerializedArgument {
    let remote = RemoteError::from_anyhow(error);
    SerializedArgument::Error {
        message: remote.message,
        stack: remote.stack,
    }
}
