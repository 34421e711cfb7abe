use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::Timestamp;
use crate::firestore::value::MapValue;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FirestoreValue {
    kind: ValueKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(Vec<u8>),
    Reference(String),
    Array(Vec<FirestoreValue>),
    Map(MapValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: Vec<u8>) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    /// Reference to another document, stored as its full resource name.
    pub fn from_reference(name: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(name.into()),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(values),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn from_map_value(map: MapValue) -> Self {
        Self {
            kind: ValueKind::Map(map),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn as_array(&self) -> Option<&[FirestoreValue]> {
        match &self.kind {
            ValueKind::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Stable textual form used in query and target canonical ids.
    pub fn canonical_string(&self) -> String {
        match &self.kind {
            ValueKind::Null => "null".to_string(),
            ValueKind::Boolean(value) => value.to_string(),
            ValueKind::Integer(value) => value.to_string(),
            ValueKind::Double(value) => format!("{value:?}"),
            ValueKind::Timestamp(value) => format!("time({},{})", value.seconds, value.nanos),
            ValueKind::String(value) => value.clone(),
            ValueKind::Bytes(value) => format!("bytes({value:?})"),
            ValueKind::Reference(name) => name.clone(),
            ValueKind::Array(values) => {
                let parts: Vec<String> = values.iter().map(Self::canonical_string).collect();
                format!("[{}]", parts.join(","))
            }
            ValueKind::Map(map) => {
                let parts: Vec<String> = map
                    .fields()
                    .iter()
                    .map(|(key, value)| format!("{key}:{}", value.canonical_string()))
                    .collect();
                format!("{{{}}}", parts.join(","))
            }
        }
    }
}

impl From<&str> for FirestoreValue {
    fn from(value: &str) -> Self {
        Self::from_string(value)
    }
}

impl From<String> for FirestoreValue {
    fn from(value: String) -> Self {
        Self::from_string(value)
    }
}

impl From<i64> for FirestoreValue {
    fn from(value: i64) -> Self {
        Self::from_integer(value)
    }
}

impl From<f64> for FirestoreValue {
    fn from(value: f64) -> Self {
        Self::from_double(value)
    }
}

impl From<bool> for FirestoreValue {
    fn from(value: bool) -> Self {
        Self::from_bool(value)
    }
}
