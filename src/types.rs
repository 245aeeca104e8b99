//! Core type definitions for the sync hub

use crate::error::EntityError;
use serde::de::{self, Deserializer};
use serde::ser::{self, SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Primary key of an entity
///
/// Keys are either integers or strings. Integers order before strings so
/// enumeration order (and therefore cursor positions) is stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonKey {
    Long(i64),
    Str(String),
}

impl JsonKey {
    /// Interpret a JSON value as a key. Only integers and strings qualify.
    pub fn from_value(value: &serde_json::Value) -> Option<JsonKey> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(JsonKey::Long),
            serde_json::Value::String(s) => Some(JsonKey::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        match self {
            JsonKey::Long(v) => serde_json::Value::from(*v),
            JsonKey::Str(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

impl Ord for JsonKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (JsonKey::Long(a), JsonKey::Long(b)) => a.cmp(b),
            (JsonKey::Str(a), JsonKey::Str(b)) => a.cmp(b),
            (JsonKey::Long(_), JsonKey::Str(_)) => Ordering::Less,
            (JsonKey::Str(_), JsonKey::Long(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for JsonKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for JsonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonKey::Long(v) => write!(f, "{}", v),
            JsonKey::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for JsonKey {
    fn from(v: i64) -> Self {
        JsonKey::Long(v)
    }
}

impl From<&str> for JsonKey {
    fn from(v: &str) -> Self {
        JsonKey::Str(v.to_string())
    }
}

impl From<String> for JsonKey {
    fn from(v: String) -> Self {
        JsonKey::Str(v)
    }
}

/// Serialized JSON document
///
/// Holds the UTF-8 bytes of one JSON value. Cloning is cheap: the bytes are
/// shared and never mutated once created.
#[derive(Clone, PartialEq, Eq)]
pub struct JsonValue(Arc<[u8]>);

impl JsonValue {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        JsonValue(Arc::from(bytes.into().into_boxed_slice()))
    }

    pub fn from_value(value: &serde_json::Value) -> Self {
        // Serializing a Value into memory cannot fail
        JsonValue::from_bytes(value.to_string())
    }

    pub fn null() -> Self {
        JsonValue::from_bytes(b"null".to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True for the literal `null` (surrounding whitespace ignored)
    pub fn is_null(&self) -> bool {
        let text = self.0.as_ref();
        let start = text.iter().position(|b| !b.is_ascii_whitespace());
        let end = text.iter().rposition(|b| !b.is_ascii_whitespace());
        match (start, end) {
            (Some(s), Some(e)) => &text[s..=e] == b"null",
            _ => false,
        }
    }

    pub fn parse(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    /// Copy the bytes into a fresh allocation that shares nothing with `self`
    pub fn deep_copy(&self) -> JsonValue {
        JsonValue::from_bytes(self.0.to_vec())
    }

    /// True if both values share the same allocation
    pub fn shares_buffer(&self, other: &JsonValue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for JsonValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JsonValue({})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for JsonValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<serde_json::Value> for JsonValue {
    fn from(value: serde_json::Value) -> Self {
        JsonValue::from_value(&value)
    }
}

impl Serialize for JsonValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = self.parse().map_err(ser::Error::custom)?;
        value.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JsonValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer).map_err(de::Error::custom)?;
        Ok(JsonValue::from_value(&value))
    }
}

/// An entity submitted for writing: key plus JSON document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonEntity {
    pub key: JsonKey,
    pub value: JsonValue,
}

impl JsonEntity {
    pub fn new(key: impl Into<JsonKey>, value: serde_json::Value) -> Self {
        JsonEntity {
            key: key.into(),
            value: JsonValue::from_value(&value),
        }
    }
}

/// Outcome for one key of a read
#[derive(Debug, Clone, PartialEq)]
pub enum EntityState {
    Value(JsonValue),
    Missing,
    Error(EntityError),
}

/// Entity as returned by read/query: value, absence or error, never both
#[derive(Debug, Clone, PartialEq)]
pub struct EntityValue {
    pub key: JsonKey,
    pub state: EntityState,
}

impl EntityValue {
    pub fn with_value(key: JsonKey, value: JsonValue) -> Self {
        EntityValue { key, state: EntityState::Value(value) }
    }

    pub fn missing(key: JsonKey) -> Self {
        EntityValue { key, state: EntityState::Missing }
    }

    pub fn with_error(key: JsonKey, error: EntityError) -> Self {
        EntityValue { key, state: EntityState::Error(error) }
    }

    pub fn value(&self) -> Option<&JsonValue> {
        match &self.state {
            EntityState::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&EntityError> {
        match &self.state {
            EntityState::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn set_error(&mut self, error: EntityError) {
        self.state = EntityState::Error(error);
    }
}

impl Serialize for EntityValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("EntityValue", 2)?;
        state.serialize_field("key", &self.key)?;
        match &self.state {
            EntityState::Value(v) => state.serialize_field("value", v)?,
            EntityState::Missing => state.serialize_field("value", &serde_json::Value::Null)?,
            EntityState::Error(e) => state.serialize_field("error", e)?,
        }
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ordering() {
        let mut keys = vec![
            JsonKey::from("b"),
            JsonKey::from(10),
            JsonKey::from("a"),
            JsonKey::from(2),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![JsonKey::from(2), JsonKey::from(10), JsonKey::from("a"), JsonKey::from("b")]
        );
    }

    #[test]
    fn test_key_serde_untagged() {
        let keys: Vec<JsonKey> = serde_json::from_value(json!([1, "x"])).unwrap();
        assert_eq!(keys, vec![JsonKey::Long(1), JsonKey::Str("x".to_string())]);
    }

    #[test]
    fn test_is_null() {
        assert!(JsonValue::from_bytes(" null\n").is_null());
        assert!(!JsonValue::from_bytes("{}").is_null());
        assert!(!JsonValue::from_bytes("").is_null());
    }

    #[test]
    fn test_deep_copy_does_not_share() {
        let a = JsonValue::from_value(&json!({"a": 1}));
        let b = a.clone();
        let c = a.deep_copy();
        assert!(a.shares_buffer(&b));
        assert!(!a.shares_buffer(&c));
        assert_eq!(a, c);
    }

    #[test]
    fn test_entity_value_serialization() {
        let ok = EntityValue::with_value(JsonKey::from(1), JsonValue::from_value(&json!({"a": 1})));
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"key": 1, "value": {"a": 1}}));

        let missing = EntityValue::missing(JsonKey::from("x"));
        assert_eq!(serde_json::to_value(&missing).unwrap(), json!({"key": "x", "value": null}));
    }
}
