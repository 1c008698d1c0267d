//! Self-describing values carried in command params and persisted blobs.
//!
//! Every value that crosses the bus — byte strings, integers, booleans,
//! null, lists, maps — round-trips through [`WireValue`] encoded as
//! MessagePack. Opaque identifiers (route ids, uuids, public keys, tags)
//! stay byte strings end to end.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A single self-describing wire value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    /// Absent / null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// Opaque byte string.
    Bytes(Vec<u8>),
    /// UTF-8 text.
    Str(String),
    /// Ordered list.
    List(Vec<WireValue>),
    /// String-keyed map.
    Map(BTreeMap<String, WireValue>),
}

/// A params / results map as carried on a message.
pub type WireMap = BTreeMap<String, WireValue>;

impl WireValue {
    /// Bytes view: byte strings directly, text as its UTF-8 bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            WireValue::Bytes(b) => Some(b),
            WireValue::Str(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Text view: text directly, byte strings when valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::Str(s) => Some(s),
            WireValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            WireValue::Int(n) => Some(*n),
            WireValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            WireValue::Float(f) => Some(*f),
            WireValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WireValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[WireValue]> {
        match self {
            WireValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&WireMap> {
        match self {
            WireValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, WireValue::Null)
    }

    /// Encode to MessagePack.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Decode from MessagePack.
    pub fn from_bytes(data: &[u8]) -> Result<WireValue> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

impl From<&str> for WireValue {
    fn from(s: &str) -> Self {
        WireValue::Str(s.to_string())
    }
}

impl From<String> for WireValue {
    fn from(s: String) -> Self {
        WireValue::Str(s)
    }
}

impl From<Vec<u8>> for WireValue {
    fn from(b: Vec<u8>) -> Self {
        WireValue::Bytes(b)
    }
}

impl From<&[u8]> for WireValue {
    fn from(b: &[u8]) -> Self {
        WireValue::Bytes(b.to_vec())
    }
}

impl From<i64> for WireValue {
    fn from(n: i64) -> Self {
        WireValue::Int(n)
    }
}

impl From<u16> for WireValue {
    fn from(n: u16) -> Self {
        WireValue::Int(i64::from(n))
    }
}

impl From<bool> for WireValue {
    fn from(b: bool) -> Self {
        WireValue::Bool(b)
    }
}

impl<T: Into<WireValue>> From<Option<T>> for WireValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => WireValue::Null,
        }
    }
}

impl From<Vec<WireValue>> for WireValue {
    fn from(l: Vec<WireValue>) -> Self {
        WireValue::List(l)
    }
}

impl From<WireMap> for WireValue {
    fn from(m: WireMap) -> Self {
        WireValue::Map(m)
    }
}

/// Build a [`WireMap`] literal: `wire_map! { "ip" => ip, "port" => 80i64 }`.
#[macro_export]
macro_rules! wire_map {
    () => { $crate::wire::WireMap::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut m = $crate::wire::WireMap::new();
        $( m.insert($key.to_string(), $crate::wire::WireValue::from($value)); )+
        m
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_nested() {
        let value = WireValue::Map(wire_map! {
            "uuid" => b"ab12".to_vec(),
            "count" => 42i64,
            "live" => true,
            "tag" => WireValue::Null,
            "list" => vec![WireValue::Int(1), WireValue::Str("two".into())],
        });
        let encoded = value.to_bytes().unwrap();
        let decoded = WireValue::from_bytes(&encoded).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn test_bytes_preserved_verbatim() {
        let raw = vec![0u8, 255, 1, 254, 127];
        let value = WireValue::Bytes(raw.clone());
        let decoded = WireValue::from_bytes(&value.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.as_bytes(), Some(raw.as_slice()));
    }

    #[test]
    fn test_str_bytes_views() {
        assert_eq!(WireValue::Str("web".into()).as_bytes(), Some(b"web".as_slice()));
        assert_eq!(WireValue::Bytes(b"web".to_vec()).as_str(), Some("web"));
        assert_eq!(WireValue::Int(7).as_bytes(), None);
    }
}
