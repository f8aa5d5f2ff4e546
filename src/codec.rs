//! Message codecs: content-type plus one-way `encode`. Decoding is the
//! caller's concern (see `Message::unmarshal_to` in [`crate::channel::consumer`]).

use serde::Serialize;

use crate::error::{RabbitMqError, Result};

/// A value that a [`Codec`] knows how to turn into bytes.
///
/// This is deliberately narrow: the text codec only accepts strings and raw
/// byte sequences, so it is modeled as an enum rather than a generic trait
/// bound that every caller would have to satisfy.
pub enum EncodeInput<'a> {
    /// A UTF-8 string.
    Text(&'a str),
    /// Raw bytes.
    Bytes(&'a [u8]),
    /// Anything else serde can serialize: numbers, structs, enums, maps.
    /// [`TextCodec`] always rejects this variant with `EncodingUnsupported`.
    Value(&'a dyn erased_serde_json::SerializeJson),
}

/// Narrow internal helper so `EncodeInput::Value` can hold a `&dyn` without
/// pulling in the `erased-serde` crate for a single call site.
pub mod erased_serde_json {
    use serde::Serialize;
    use serde_json::Value;

    /// Object-safe subset of `Serialize`, used only to type-erase the value
    /// passed to [`super::EncodeInput::Value`].
    pub trait SerializeJson {
        /// Serializes `self` into a `serde_json::Value`.
        fn to_json_value(&self) -> serde_json::Result<Value>;
    }

    impl<T: Serialize> SerializeJson for T {
        fn to_json_value(&self) -> serde_json::Result<Value> {
            serde_json::to_value(self)
        }
    }
}

/// A content-type tag plus a one-way encoder.
///
/// Implementations are values passed in, not subclasses: callers select a
/// codec the same way they select a handler, by passing the capability they
/// want rather than relying on polymorphism through a base type.
pub trait Codec: Send + Sync {
    /// MIME content-type this codec produces, e.g. `application/json`.
    fn content_type(&self) -> &'static str;

    /// Encodes `value` into bytes, or fails with
    /// [`RabbitMqError::EncodingUnsupported`] if this codec cannot represent
    /// the given input.
    fn encode(&self, value: &EncodeInput<'_>) -> Result<Vec<u8>>;
}

/// Produces canonical JSON. Accepts [`EncodeInput::Value`] and
/// [`EncodeInput::Text`]; raw [`EncodeInput::Bytes`] are rejected since this
/// codec has no way to know they are already valid JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, value: &EncodeInput<'_>) -> Result<Vec<u8>> {
        match value {
            EncodeInput::Value(v) => {
                let value = v
                    .to_json_value()
                    .map_err(|_| RabbitMqError::EncodingUnsupported)?;
                serde_json::to_vec(&value).map_err(|_| RabbitMqError::EncodingUnsupported)
            }
            EncodeInput::Text(s) => {
                serde_json::to_vec(s).map_err(|_| RabbitMqError::EncodingUnsupported)
            }
            EncodeInput::Bytes(_) => Err(RabbitMqError::EncodingUnsupported),
        }
    }
}

/// Accepts only string or byte-sequence inputs; fails with
/// [`RabbitMqError::EncodingUnsupported`] for anything else (in particular,
/// it never accepts [`EncodeInput::Value`]; structured values must go
/// through [`JsonCodec`]).
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodec;

impl Codec for TextCodec {
    fn content_type(&self) -> &'static str {
        "text/plain"
    }

    fn encode(&self, value: &EncodeInput<'_>) -> Result<Vec<u8>> {
        match value {
            EncodeInput::Text(s) => Ok(s.as_bytes().to_vec()),
            EncodeInput::Bytes(b) => Ok(b.to_vec()),
            EncodeInput::Value(_) => Err(RabbitMqError::EncodingUnsupported),
        }
    }
}

/// Convenience helper so callers of [`JsonCodec`] don't have to construct an
/// `EncodeInput` by hand.
pub fn encode_json<T: Serialize>(codec: &JsonCodec, value: &T) -> Result<Vec<u8>> {
    codec.encode(&EncodeInput::Value(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_encodes_canonical_json() {
        let codec = JsonCodec;
        let bytes = encode_json(&codec, &"test").unwrap();
        assert_eq!(bytes, b"\"test\"");
        assert_eq!(codec.content_type(), "application/json");
    }

    #[test]
    fn text_codec_encodes_strings_as_utf8() {
        let codec = TextCodec;
        let bytes = codec.encode(&EncodeInput::Text("test")).unwrap();
        assert_eq!(bytes, b"test");
        assert_eq!(codec.content_type(), "text/plain");
    }

    #[test]
    fn text_codec_encodes_raw_bytes() {
        let codec = TextCodec;
        let bytes = codec.encode(&EncodeInput::Bytes(b"raw")).unwrap();
        assert_eq!(bytes, b"raw");
    }

    #[test]
    fn text_codec_rejects_integer_input() {
        let codec = TextCodec;
        let err = codec.encode(&EncodeInput::Value(&42)).unwrap_err();
        assert!(matches!(err, RabbitMqError::EncodingUnsupported));
    }
}
