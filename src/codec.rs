//! Encoding of the `data` and `result` columns.
//!
//! The queue hands processors and handlers [`serde_json::Value`]s; a [`Codec`]
//! decides how those values are stored as text.

use crate::errors::CodecError;
use serde_json::Value;

/// Converts job payloads and results to and from their stored form.
pub trait Codec: Send + Sync + 'static {
    /// Encode a value for storage.
    fn encode(&self, value: &Value) -> Result<String, CodecError>;

    /// Decode a stored value.
    fn decode(&self, raw: &str) -> Result<Value, CodecError>;

    /// Decode an optional column; a missing value decodes to `null`.
    fn decode_column(&self, raw: Option<&str>) -> Result<Value, CodecError> {
        raw.map_or(Ok(Value::Null), |raw| self.decode(raw))
    }
}

/// Stores values as JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode(&self, raw: &str) -> Result<Value, CodecError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_columns_decode_to_null() {
        assert_eq!(JsonCodec.decode_column(None).unwrap(), Value::Null);
    }

    #[test]
    fn json_is_stored_compact() {
        assert_eq!(JsonCodec.encode(&json!({ "a": 1 })).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(JsonCodec.decode("{not json").is_err());
    }
}
