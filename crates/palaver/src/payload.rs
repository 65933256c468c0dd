//! Payload (de)serialization seam.
//!
//! The engine moves opaque bytes; typed payloads enter and leave through
//! [`PayloadSerialize`]. Implementations declare their content type with a
//! format designator (`Json/ecma/404`, `raw/0`, ...) or a MIME equivalent,
//! and reject content types they cannot decode so the executor can answer
//! with 415 instead of feeding garbage to a handler.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// MQTT v5 payload format indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatIndicator {
    /// 0, unspecified bytes.
    #[default]
    UnspecifiedBytes,
    /// 1, UTF-8 encoded character data.
    Utf8EncodedCharacterData,
}

impl FormatIndicator {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FormatIndicator::UnspecifiedBytes),
            1 => Some(FormatIndicator::Utf8EncodedCharacterData),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            FormatIndicator::UnspecifiedBytes => 0,
            FormatIndicator::Utf8EncodedCharacterData => 1,
        }
    }
}

/// Format designators, `{NAME}/{VERSION}`.
pub const FORMAT_AVRO: &str = "Avro/1.11.0";
pub const FORMAT_CBOR: &str = "Cbor/rfc/8949";
pub const FORMAT_JSON: &str = "Json/ecma/404";
pub const FORMAT_PROTOBUF2: &str = "Protobuf/2";
pub const FORMAT_PROTOBUF3: &str = "Protobuf/3";
pub const FORMAT_RAW: &str = "raw/0";

/// MIME equivalent for a designator, where one exists.
pub fn designator_mime(designator: &str) -> Option<&'static str> {
    match designator {
        FORMAT_AVRO => Some("application/avro"),
        FORMAT_CBOR => Some("application/cbor"),
        FORMAT_JSON => Some("application/json"),
        FORMAT_PROTOBUF2 | FORMAT_PROTOBUF3 => Some("application/protobuf"),
        FORMAT_RAW => Some("application/octet-stream"),
        _ => None,
    }
}

/// Bytes ready for the wire, tagged with how they should be described.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedPayload {
    pub payload: Vec<u8>,
    /// Empty string means "send no content type".
    pub content_type: String,
    pub format_indicator: FormatIndicator,
}

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("failed to serialize payload: {0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    /// Maps to status 415 on the executor side.
    #[error("unsupported content type {0:?}")]
    UnsupportedContentType(String),
    /// Maps to status 400.
    #[error("malformed payload: {0}")]
    Malformed(String),
    /// A payload where none was expected (or vice versa). Maps to 400.
    #[error("unexpected payload: {0}")]
    UnexpectedPayload(String),
}

/// Implemented by request and response payload types.
pub trait PayloadSerialize: Send + Sync + Sized + 'static {
    fn serialize(&self) -> Result<SerializedPayload, SerializeError>;

    /// `content_type` is the received content-type property, if any;
    /// implementations should accept their own designator, its MIME
    /// equivalent, and absence.
    fn deserialize(
        payload: &[u8],
        content_type: Option<&str>,
        format_indicator: FormatIndicator,
    ) -> Result<Self, DeserializeError>;
}

/// JSON payloads via serde.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> PayloadSerialize for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn serialize(&self) -> Result<SerializedPayload, SerializeError> {
        let payload =
            serde_json::to_vec(&self.0).map_err(|e| SerializeError::Failed(e.to_string()))?;
        Ok(SerializedPayload {
            payload,
            content_type: "application/json".to_string(),
            format_indicator: FormatIndicator::Utf8EncodedCharacterData,
        })
    }

    fn deserialize(
        payload: &[u8],
        content_type: Option<&str>,
        _format_indicator: FormatIndicator,
    ) -> Result<Self, DeserializeError> {
        match content_type {
            None | Some("application/json") | Some(FORMAT_JSON) => {}
            Some(other) => {
                return Err(DeserializeError::UnsupportedContentType(other.to_string()));
            }
        }
        let value =
            serde_json::from_slice(payload).map_err(|e| DeserializeError::Malformed(e.to_string()))?;
        Ok(Json(value))
    }
}

/// Passthrough bytes, `raw/0`. Accepts any content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBytes(pub Vec<u8>);

impl PayloadSerialize for RawBytes {
    fn serialize(&self) -> Result<SerializedPayload, SerializeError> {
        Ok(SerializedPayload {
            payload: self.0.clone(),
            content_type: FORMAT_RAW.to_string(),
            format_indicator: FormatIndicator::UnspecifiedBytes,
        })
    }

    fn deserialize(
        payload: &[u8],
        _content_type: Option<&str>,
        _format_indicator: FormatIndicator,
    ) -> Result<Self, DeserializeError> {
        Ok(RawBytes(payload.to_vec()))
    }
}

/// The empty payload. Serializes to zero bytes with no content type and
/// insists the peer sent none either.
impl PayloadSerialize for () {
    fn serialize(&self) -> Result<SerializedPayload, SerializeError> {
        Ok(SerializedPayload {
            payload: Vec::new(),
            content_type: String::new(),
            format_indicator: FormatIndicator::UnspecifiedBytes,
        })
    }

    fn deserialize(
        payload: &[u8],
        _content_type: Option<&str>,
        _format_indicator: FormatIndicator,
    ) -> Result<Self, DeserializeError> {
        if payload.is_empty() {
            Ok(())
        } else {
            Err(DeserializeError::UnexpectedPayload(format!(
                "expected empty payload, got {} bytes",
                payload.len()
            )))
        }
    }
}
