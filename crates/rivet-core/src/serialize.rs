//! Payload serialization, selected on the wire by the codec byte.
//!
//! The runtime itself only moves opaque bytes; this module is the hook that
//! turns typed values into those bytes and back. The registry is an enum so
//! adding a format is a new variant, not a trait object graph. Class-name
//! resolution is independent of serialization: receivers route by class
//! name and only then decode content.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SerialError;

/// Wire codec byte for JSON payloads.
pub const CODEC_JSON: u8 = 1;
/// Wire codec byte for raw (caller-framed) payloads.
pub const CODEC_RAW: u8 = 2;

/// A registered payload codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadCodec {
    Json,
    /// Pass-through: content bytes are handed to the processor untouched.
    Raw,
}

impl PayloadCodec {
    /// Resolve a wire codec byte. Unknown bytes fail here, before any
    /// content is touched.
    pub fn from_code(code: u8) -> Result<Self, SerialError> {
        match code {
            CODEC_JSON => Ok(Self::Json),
            CODEC_RAW => Ok(Self::Raw),
            other => Err(SerialError::UnknownCodec(other)),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Json => CODEC_JSON,
            Self::Raw => CODEC_RAW,
        }
    }

    /// Serialize a typed value into content bytes.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes, SerialError> {
        match self {
            Self::Json => Ok(Bytes::from(serde_json::to_vec(value)?)),
            Self::Raw => Err(SerialError::UnsupportedType(
                "typed values; use raw content bytes with the raw codec",
            )),
        }
    }

    /// Deserialize content bytes into a typed value.
    pub fn decode<T: DeserializeOwned>(self, content: &[u8]) -> Result<T, SerialError> {
        match self {
            Self::Json => Ok(serde_json::from_slice(content)?),
            Self::Raw => Err(SerialError::UnsupportedType(
                "typed values; read raw content bytes with the raw codec",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let value = vec!["a".to_string(), "b".to_string()];
        let bytes = PayloadCodec::Json.encode(&value).unwrap();
        let back: Vec<String> = PayloadCodec::Json.decode(&bytes).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn unknown_codec_byte_fails() {
        assert!(matches!(
            PayloadCodec::from_code(9),
            Err(SerialError::UnknownCodec(9))
        ));
    }

    #[test]
    fn raw_rejects_typed_values() {
        assert!(PayloadCodec::Raw.encode(&42u32).is_err());
        assert!(PayloadCodec::Raw.decode::<u32>(b"42").is_err());
    }

    #[test]
    fn json_decode_failure_surfaces() {
        let err = PayloadCodec::Json.decode::<u32>(b"not json").unwrap_err();
        assert!(matches!(err, SerialError::Json(_)));
    }
}
