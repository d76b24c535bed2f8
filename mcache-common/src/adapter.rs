//! # Value Adapters
//!
//! Purpose: Turn the raw bytes of a fetched item into the value handed to the
//! caller. Adapters are pure: they never touch connection state.
//!
//! ## Design Principles
//! 1. **Text by Default**: Most cached payloads are UTF-8; invalid sequences
//!    are replaced rather than failing the whole fetch.
//! 2. **Zero-Copy Binary**: The binary adapter hands back the received `Bytes`
//!    slice without copying.
//! 3. **Open Extension**: Applications plug in their own decoding through
//!    `Adapter::Custom`.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// Raw item as it came off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Opaque client flags stored alongside the value.
    pub flags: u32,
    /// Exactly `size` bytes of payload.
    pub data: Bytes,
}

impl Item {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Value exposed to the caller after adaptation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Bytes(Bytes),
    Json(serde_json::Value),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            Value::Text(text) => Some(text.as_bytes()),
            Value::Json(_) => None,
        }
    }
}

type AdapterFn = dyn Fn(&Item) -> Value + Send + Sync;

/// Transformation applied to every fetched item.
#[derive(Clone, Default)]
pub enum Adapter {
    /// Lossy UTF-8 decode.
    #[default]
    Text,
    /// Raw bytes, flags dropped.
    Binary,
    /// JSON document; invalid JSON becomes `{"val": <text>}`.
    Json,
    Custom(Arc<AdapterFn>),
}

impl Adapter {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Item) -> Value + Send + Sync + 'static,
    {
        Adapter::Custom(Arc::new(f))
    }

    pub fn apply(&self, item: &Item) -> Value {
        match self {
            Adapter::Text => Value::Text(String::from_utf8_lossy(&item.data).into_owned()),
            Adapter::Binary => Value::Bytes(item.data.clone()),
            Adapter::Json => {
                let text = String::from_utf8_lossy(&item.data);
                match serde_json::from_str(&text) {
                    Ok(json) => Value::Json(json),
                    Err(_) => Value::Json(serde_json::json!({ "val": text })),
                }
            }
            Adapter::Custom(f) => f(item),
        }
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Adapter::Text => f.write_str("Text"),
            Adapter::Binary => f.write_str("Binary"),
            Adapter::Json => f.write_str("Json"),
            Adapter::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(data: &'static [u8]) -> Item {
        Item {
            flags: 0,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn text_adapter_decodes_utf8() {
        let value = Adapter::Text.apply(&item(b"12345"));
        assert_eq!(value, Value::Text("12345".to_string()));
    }

    #[test]
    fn binary_adapter_keeps_bytes() {
        let value = Adapter::Binary.apply(&item(b"12345"));
        assert_eq!(value.as_bytes(), Some(&b"12345"[..]));
    }

    #[test]
    fn json_adapter_parses_valid_json() {
        let value = Adapter::Json.apply(&item(br#"{ "thing": "one" }"#));
        assert_eq!(value, Value::Json(serde_json::json!({ "thing": "one" })));
    }

    #[test]
    fn json_adapter_wraps_invalid_json() {
        let value = Adapter::Json.apply(&item(br#"{ "thing""#));
        assert_eq!(value, Value::Json(serde_json::json!({ "val": "{ \"thing\"" })));
    }

    #[test]
    fn custom_adapter_sees_flags() {
        let adapter = Adapter::custom(|item| Value::Text(format!("{}:{}", item.flags, item.size())));
        let value = adapter.apply(&Item {
            flags: 7,
            data: Bytes::from_static(b"abc"),
        });
        assert_eq!(value.as_text(), Some("7:3"));
    }
}
