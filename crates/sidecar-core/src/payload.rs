//! Structured payload carried in envelope `args`, `data` and `error` fields.
//!
//! JSON has no binary type, so the wire uses the convention
//! `{"__b64": "<base64>"}` for byte strings. [`Payload::from_wire`] replaces
//! every such marker, at any nesting depth, with [`Payload::Bytes`] before the
//! value reaches a consumer; [`Payload::to_wire`] reverses it.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

/// Object key marking a base64-encoded binary value on the wire.
pub const BINARY_MARKER: &str = "__b64";

/// A JSON-like value that can also hold raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Payload {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Self>),
    Object(BTreeMap<String, Self>),
}

impl Payload {
    /// An empty object, `{}`.
    pub const fn empty_object() -> Self {
        Self::Object(BTreeMap::new())
    }

    /// Convert a wire value, decoding every binary marker into bytes.
    ///
    /// A marker whose string is not valid base64, or an object carrying the
    /// marker key alongside other keys, is left as an ordinary object.
    pub fn from_wire(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from_wire).collect()),
            Value::Object(map) => match decode_marker(&map) {
                Some(bytes) => Self::Bytes(bytes),
                None => Self::Object(
                    map.into_iter()
                        .map(|(key, value)| (key, Self::from_wire(value)))
                        .collect(),
                ),
            },
        }
    }

    /// Convert to a wire value, encoding bytes as binary markers.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::String(s) => Value::String(s.clone()),
            Self::Bytes(bytes) => {
                let mut marker = Map::with_capacity(1);
                marker.insert(
                    BINARY_MARKER.to_string(),
                    Value::String(STANDARD.encode(bytes)),
                );
                Value::Object(marker)
            }
            Self::Array(items) => Value::Array(items.iter().map(Self::to_wire).collect()),
            Self::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_wire()))
                    .collect(),
            ),
        }
    }

    /// Look up a key when this payload is an object.
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub const fn as_array(&self) -> Option<&Vec<Self>> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub const fn as_object(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Take ownership of the object map, if this payload is one.
    pub fn into_object(self) -> Option<BTreeMap<String, Self>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }
}

fn decode_marker(map: &Map<String, Value>) -> Option<Vec<u8>> {
    if map.len() != 1 {
        return None;
    }
    let encoded = map.get(BINARY_MARKER)?.as_str()?;
    STANDARD.decode(encoded).ok()
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_wire)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<bool> for Payload {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<u64> for Payload {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<BTreeMap<String, Self>> for Payload {
    fn from(map: BTreeMap<String, Self>) -> Self {
        Self::Object(map)
    }
}
