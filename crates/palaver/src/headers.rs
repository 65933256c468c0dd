//! Wire headers: the MQTT v5 properties both engines read and write.
//!
//! A request travels as correlation data (16 raw bytes), a response topic,
//! a message expiry, and a handful of `__`-prefixed user properties; a
//! response echoes the correlation data and reports its outcome in
//! `__stat` and friends. This module owns the property names and the
//! build/parse logic so the invoker and executor agree byte-for-byte.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use crate::error::{ProtocolError, StatusCode};
use crate::hlc::HybridLogicalClock;
use crate::payload::FormatIndicator;
use crate::transport::PublishProperties;

pub const PROP_STATUS: &str = "__stat";
pub const PROP_STATUS_MESSAGE: &str = "__stMsg";
pub const PROP_IS_APPLICATION_ERROR: &str = "__apErr";
pub const PROP_INVALID_NAME: &str = "__propName";
pub const PROP_INVALID_VALUE: &str = "__propVal";
pub const PROP_PROTOCOL_VERSION: &str = "__protVer";
pub const PROP_SUPPORTED_MAJOR_VERSIONS: &str = "__supProtMajVer";
pub const PROP_REQUEST_PROTOCOL_VERSION: &str = "__requestProtVer";
pub const PROP_TIMESTAMP: &str = "__ts";
pub const PROP_FENCING_TOKEN: &str = "__ft";
pub const PROP_INVOKER_CLIENT_ID: &str = "__invId";
pub const PROP_PARTITION: &str = "$partition";

/// Names used in error context for the MQTT v5 standard properties, which
/// have no user-property key of their own.
pub const HEADER_CORRELATION_DATA: &str = "Correlation Data";
pub const HEADER_RESPONSE_TOPIC: &str = "Response Topic";
pub const HEADER_MESSAGE_EXPIRY: &str = "Message Expiry";
pub const HEADER_CONTENT_TYPE: &str = "Content Type";

/// Expiry window granted to the 400 response for a request that carried no
/// message expiry of its own.
const MISSING_EXPIRY_RESPONSE_WINDOW: Duration = Duration::from_secs(10);

/// `"<major>.<minor>"`. Minor bumps are bidirectionally compatible; major
/// bumps are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

/// The version this engine speaks.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

/// Major versions this engine accepts from peers.
pub const SUPPORTED_MAJOR_VERSIONS: &[u16] = &[1];

impl ProtocolVersion {
    pub fn is_supported(&self) -> bool {
        SUPPORTED_MAJOR_VERSIONS.contains(&self.major)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s.split_once('.').ok_or(())?;
        Ok(Self {
            major: major.parse().map_err(|_| ())?,
            minor: minor.parse().map_err(|_| ())?,
        })
    }
}

pub fn format_supported_majors(majors: &[u16]) -> String {
    majors
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_supported_majors(s: &str) -> Option<Vec<u16>> {
    s.split_whitespace().map(|v| v.parse().ok()).collect()
}

/// The full header set of an outbound request.
#[derive(Debug, Clone)]
pub struct RequestHeaders {
    pub correlation_id: Uuid,
    pub response_topic: String,
    pub message_expiry: Duration,
    pub content_type: Option<String>,
    pub format_indicator: FormatIndicator,
    pub timestamp: HybridLogicalClock,
    pub fencing_token: Option<HybridLogicalClock>,
    pub invoker_client_id: String,
    pub protocol_version: ProtocolVersion,
    /// Consistent-routing key for shared subscriptions; defaults to the
    /// invoker client id.
    pub partition: String,
}

impl RequestHeaders {
    pub fn to_properties(&self) -> PublishProperties {
        let mut props = PublishProperties {
            content_type: self.content_type.clone(),
            payload_format_indicator: Some(self.format_indicator),
            correlation_data: Some(Bytes::copy_from_slice(self.correlation_id.as_bytes())),
            response_topic: Some(self.response_topic.clone()),
            message_expiry_interval: Some(expiry_seconds(self.message_expiry)),
            user_properties: Vec::new(),
        };
        props.push_user_property(PROP_TIMESTAMP, self.timestamp.to_string());
        props.push_user_property(PROP_INVOKER_CLIENT_ID, self.invoker_client_id.clone());
        props.push_user_property(PROP_PROTOCOL_VERSION, self.protocol_version.to_string());
        if let Some(ft) = &self.fencing_token {
            props.push_user_property(PROP_FENCING_TOKEN, ft.to_string());
        }
        props.push_user_property(PROP_PARTITION, self.partition.clone());
        props
    }

    /// Parse an inbound request's properties.
    pub fn parse(props: &PublishProperties) -> Result<Self, RequestFault> {
        // Without a usable correlation id or response topic there is
        // nothing to respond to: these faults are swallowed (logged by the
        // caller, ack only). Everything after is respondable.
        let correlation_id = match &props.correlation_data {
            Some(data) => Uuid::from_slice(data).map_err(|_| {
                RequestFault::Silent(format!(
                    "correlation data is {} bytes, expected 16",
                    data.len()
                ))
            })?,
            None => return Err(RequestFault::Silent("no correlation data".into())),
        };
        let response_topic = match &props.response_topic {
            Some(topic) if crate::topic::is_valid_topic(topic) => topic.clone(),
            Some(topic) => {
                return Err(RequestFault::Silent(format!(
                    "unpublishable response topic {topic:?}"
                )));
            }
            None => return Err(RequestFault::Silent("no response topic".into())),
        };
        let message_expiry = props
            .message_expiry_interval
            .map(|seconds| Duration::from_secs(u64::from(seconds)));

        let envelope = RequestEnvelope {
            correlation_id,
            response_topic,
            // A request without an expiry still gets its 400 below; the
            // error response needs a window of its own.
            message_expiry: message_expiry.unwrap_or(MISSING_EXPIRY_RESPONSE_WINDOW),
        };
        let fault = |error: ProtocolError| RequestFault::Respond {
            envelope: envelope.clone(),
            error: error.with_correlation(correlation_id),
        };

        let message_expiry = match message_expiry {
            Some(expiry) => expiry,
            None => return Err(fault(ProtocolError::header_missing(HEADER_MESSAGE_EXPIRY))),
        };

        let timestamp = match props.user_property(PROP_TIMESTAMP) {
            Some(raw) => raw.parse::<HybridLogicalClock>().map_err(|e| {
                fault(ProtocolError::header_invalid(PROP_TIMESTAMP, raw, e.to_string()))
            })?,
            None => return Err(fault(ProtocolError::header_missing(PROP_TIMESTAMP))),
        };
        let invoker_client_id = match props.user_property(PROP_INVOKER_CLIENT_ID) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(fault(ProtocolError::header_missing(PROP_INVOKER_CLIENT_ID))),
        };
        let protocol_version = match props.user_property(PROP_PROTOCOL_VERSION) {
            Some(raw) => raw.parse::<ProtocolVersion>().map_err(|()| {
                fault(ProtocolError::header_invalid(
                    PROP_PROTOCOL_VERSION,
                    raw,
                    "expected <major>.<minor>",
                ))
            })?,
            None => PROTOCOL_VERSION,
        };
        let fencing_token = match props.user_property(PROP_FENCING_TOKEN) {
            Some(raw) => Some(raw.parse::<HybridLogicalClock>().map_err(|e| {
                fault(ProtocolError::header_invalid(PROP_FENCING_TOKEN, raw, e.to_string()))
            })?),
            None => None,
        };
        let partition = props
            .user_property(PROP_PARTITION)
            .unwrap_or(&invoker_client_id)
            .to_string();

        Ok(Self {
            correlation_id,
            response_topic: envelope.response_topic.clone(),
            message_expiry,
            content_type: props.content_type.clone(),
            format_indicator: props.payload_format_indicator.unwrap_or_default(),
            timestamp,
            fencing_token,
            invoker_client_id,
            protocol_version,
            partition,
        })
    }
}

/// The respondable core of a request, recovered even when the rest of the
/// headers are faulty.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub correlation_id: Uuid,
    pub response_topic: String,
    pub message_expiry: Duration,
}

/// How an inbound request failed to parse.
#[derive(Debug)]
pub enum RequestFault {
    /// No response is possible or owed: ack only.
    Silent(String),
    /// The envelope is intact; answer with this error.
    Respond {
        envelope: RequestEnvelope,
        error: ProtocolError,
    },
}

/// The full header set of a response.
#[derive(Debug, Clone)]
pub struct ResponseHeaders {
    pub correlation_id: Uuid,
    pub status: StatusCode,
    pub is_application_error: bool,
    pub status_message: Option<String>,
    pub invalid_property_name: Option<String>,
    pub invalid_property_value: Option<String>,
    pub timestamp: Option<HybridLogicalClock>,
    pub protocol_version: ProtocolVersion,
    pub supported_major_versions: Option<Vec<u16>>,
    pub request_protocol_version: Option<String>,
    pub content_type: Option<String>,
    pub format_indicator: FormatIndicator,
}

impl ResponseHeaders {
    pub fn ok(correlation_id: Uuid, timestamp: HybridLogicalClock) -> Self {
        Self {
            correlation_id,
            status: StatusCode::Ok,
            is_application_error: false,
            status_message: None,
            invalid_property_name: None,
            invalid_property_value: None,
            timestamp: Some(timestamp),
            protocol_version: PROTOCOL_VERSION,
            supported_major_versions: None,
            request_protocol_version: None,
            content_type: None,
            format_indicator: FormatIndicator::default(),
        }
    }

    /// Headers reporting `error` for the given correlation. Callers only
    /// pass errors with a wire status; anything else collapses to 500.
    pub fn for_error(
        correlation_id: Uuid,
        timestamp: HybridLogicalClock,
        error: &ProtocolError,
    ) -> Self {
        let status = error.wire_status().unwrap_or(StatusCode::InternalServerError);
        let in_application = matches!(
            error.kind,
            crate::error::ErrorKind::InvocationError | crate::error::ErrorKind::ExecutionError
        );
        Self {
            correlation_id,
            status,
            is_application_error: in_application,
            status_message: Some(error.to_string()),
            invalid_property_name: error
                .header_name
                .clone()
                .or_else(|| error.timeout_name.clone())
                .or_else(|| error.property_name.clone()),
            invalid_property_value: error
                .header_value
                .clone()
                .or_else(|| error.timeout_value.map(|d| d.as_millis().to_string()))
                .or_else(|| error.property_value.clone()),
            timestamp: Some(timestamp),
            protocol_version: PROTOCOL_VERSION,
            supported_major_versions: error.supported_major_protocol_versions.clone(),
            request_protocol_version: error.protocol_version.clone(),
            content_type: None,
            format_indicator: FormatIndicator::default(),
        }
    }

    pub fn to_properties(&self, message_expiry: Option<u32>) -> PublishProperties {
        let mut props = PublishProperties {
            content_type: self.content_type.clone(),
            payload_format_indicator: Some(self.format_indicator),
            correlation_data: Some(Bytes::copy_from_slice(self.correlation_id.as_bytes())),
            response_topic: None,
            message_expiry_interval: message_expiry,
            user_properties: Vec::new(),
        };
        props.push_user_property(PROP_STATUS, self.status.to_u16().to_string());
        if let Some(msg) = &self.status_message {
            props.push_user_property(PROP_STATUS_MESSAGE, msg.clone());
        }
        if self.is_application_error {
            props.push_user_property(PROP_IS_APPLICATION_ERROR, "true");
        }
        if let Some(name) = &self.invalid_property_name {
            props.push_user_property(PROP_INVALID_NAME, name.clone());
        }
        if let Some(value) = &self.invalid_property_value {
            props.push_user_property(PROP_INVALID_VALUE, value.clone());
        }
        if let Some(ts) = &self.timestamp {
            props.push_user_property(PROP_TIMESTAMP, ts.to_string());
        }
        props.push_user_property(PROP_PROTOCOL_VERSION, self.protocol_version.to_string());
        if let Some(majors) = &self.supported_major_versions {
            props.push_user_property(PROP_SUPPORTED_MAJOR_VERSIONS, format_supported_majors(majors));
        }
        if let Some(ver) = &self.request_protocol_version {
            props.push_user_property(PROP_REQUEST_PROTOCOL_VERSION, ver.clone());
        }
        props
    }

    /// Parse an inbound response's properties, as the invoker sees them.
    pub fn parse(props: &PublishProperties) -> Result<Self, ProtocolError> {
        let correlation_id = match &props.correlation_data {
            Some(data) => Uuid::from_slice(data).map_err(|_| {
                ProtocolError::header_invalid(
                    HEADER_CORRELATION_DATA,
                    format!("{} bytes", data.len()),
                    "expected 16 bytes",
                )
            })?,
            None => return Err(ProtocolError::header_missing(HEADER_CORRELATION_DATA)),
        };

        let protocol_version = match props.user_property(PROP_PROTOCOL_VERSION) {
            Some(raw) => raw.parse::<ProtocolVersion>().map_err(|()| {
                ProtocolError::header_invalid(
                    PROP_PROTOCOL_VERSION,
                    raw,
                    "expected <major>.<minor>",
                )
                .with_correlation(correlation_id)
            })?,
            None => PROTOCOL_VERSION,
        };

        let status = match props.user_property(PROP_STATUS) {
            Some(raw) => raw
                .parse::<u16>()
                .ok()
                .and_then(StatusCode::from_u16)
                .ok_or_else(|| {
                    ProtocolError::header_invalid(PROP_STATUS, raw, "unknown status code")
                        .with_correlation(correlation_id)
                })?,
            None => {
                return Err(ProtocolError::header_missing(PROP_STATUS)
                    .with_correlation(correlation_id));
            }
        };

        let timestamp = match props.user_property(PROP_TIMESTAMP) {
            Some(raw) => Some(raw.parse::<HybridLogicalClock>().map_err(|e| {
                ProtocolError::header_invalid(PROP_TIMESTAMP, raw, e.to_string())
                    .with_correlation(correlation_id)
            })?),
            None => None,
        };

        let is_application_error = props
            .user_property(PROP_IS_APPLICATION_ERROR)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        let supported_major_versions = match props.user_property(PROP_SUPPORTED_MAJOR_VERSIONS) {
            Some(raw) => Some(parse_supported_majors(raw).ok_or_else(|| {
                ProtocolError::header_invalid(
                    PROP_SUPPORTED_MAJOR_VERSIONS,
                    raw,
                    "expected space-separated integers",
                )
                .with_correlation(correlation_id)
            })?),
            None => None,
        };

        Ok(Self {
            correlation_id,
            status,
            is_application_error,
            status_message: props.user_property(PROP_STATUS_MESSAGE).map(String::from),
            invalid_property_name: props.user_property(PROP_INVALID_NAME).map(String::from),
            invalid_property_value: props.user_property(PROP_INVALID_VALUE).map(String::from),
            timestamp,
            protocol_version,
            supported_major_versions,
            request_protocol_version: props
                .user_property(PROP_REQUEST_PROTOCOL_VERSION)
                .map(String::from),
            content_type: props.content_type.clone(),
            format_indicator: props.payload_format_indicator.unwrap_or_default(),
        })
    }
}

/// Largest duration expressible in the u32 seconds of the wire's
/// message-expiry property.
pub const MAX_WIRE_TIMEOUT: Duration = Duration::from_secs(u32::MAX as u64);

/// Clamp a duration to the u32 seconds the wire property can carry,
/// rounding up so short timeouts don't vanish to zero.
pub fn expiry_seconds(duration: Duration) -> u32 {
    let secs = duration.as_secs_f64().ceil();
    if secs >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        secs as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_request() -> RequestHeaders {
        RequestHeaders {
            correlation_id: Uuid::new_v4(),
            response_topic: "clients/chef-1/devices/oven-7/commands/bake".into(),
            message_expiry: Duration::from_secs(10),
            content_type: Some("application/json".into()),
            format_indicator: FormatIndicator::Utf8EncodedCharacterData,
            timestamp: HybridLogicalClock::new(1_000, 0, "chef-1"),
            fencing_token: Some(HybridLogicalClock::new(900, 2, "chef-1")),
            invoker_client_id: "chef-1".into(),
            protocol_version: PROTOCOL_VERSION,
            partition: "chef-1".into(),
        }
    }

    #[test]
    fn request_roundtrip() {
        let headers = sample_request();
        let props = headers.to_properties();
        assert_eq!(props.message_expiry_interval, Some(10));
        assert_eq!(props.user_property(PROP_PARTITION), Some("chef-1"));

        let parsed = RequestHeaders::parse(&props).unwrap();
        assert_eq!(parsed.correlation_id, headers.correlation_id);
        assert_eq!(parsed.response_topic, headers.response_topic);
        assert_eq!(parsed.timestamp, headers.timestamp);
        assert_eq!(parsed.fencing_token, headers.fencing_token);
        assert_eq!(parsed.invoker_client_id, "chef-1");
    }

    #[test]
    fn request_without_correlation_is_silent() {
        let mut props = sample_request().to_properties();
        props.correlation_data = None;
        assert!(matches!(
            RequestHeaders::parse(&props),
            Err(RequestFault::Silent(_))
        ));
    }

    #[test]
    fn request_with_short_correlation_is_silent() {
        let mut props = sample_request().to_properties();
        props.correlation_data = Some(Bytes::from_static(b"short"));
        assert!(matches!(
            RequestHeaders::parse(&props),
            Err(RequestFault::Silent(_))
        ));
    }

    #[test]
    fn request_without_response_topic_is_silent() {
        let mut props = sample_request().to_properties();
        props.response_topic = None;
        assert!(matches!(
            RequestHeaders::parse(&props),
            Err(RequestFault::Silent(_))
        ));
    }

    #[test]
    fn request_without_expiry_is_respondable() {
        let mut props = sample_request().to_properties();
        props.message_expiry_interval = None;
        match RequestHeaders::parse(&props) {
            Err(RequestFault::Respond { envelope, error }) => {
                assert_eq!(error.kind, crate::error::ErrorKind::HeaderMissing);
                assert_eq!(error.header_name.as_deref(), Some(HEADER_MESSAGE_EXPIRY));
                // The 400 still needs a delivery window.
                assert_eq!(envelope.message_expiry, MISSING_EXPIRY_RESPONSE_WINDOW);
            }
            other => panic!("expected respondable fault, got {other:?}"),
        }
    }

    #[test]
    fn request_with_bad_timestamp_is_respondable() {
        let mut props = sample_request().to_properties();
        props
            .user_properties
            .retain(|(k, _)| k != PROP_TIMESTAMP);
        props.push_user_property(PROP_TIMESTAMP, "not-an-hlc");
        match RequestHeaders::parse(&props) {
            Err(RequestFault::Respond { envelope, error }) => {
                assert_eq!(envelope.message_expiry, Duration::from_secs(10));
                assert_eq!(error.kind, crate::error::ErrorKind::HeaderInvalid);
                assert_eq!(error.header_name.as_deref(), Some(PROP_TIMESTAMP));
            }
            other => panic!("expected respondable fault, got {other:?}"),
        }
    }

    #[test]
    fn request_without_invoker_id_is_respondable() {
        let mut props = sample_request().to_properties();
        props
            .user_properties
            .retain(|(k, _)| k != PROP_INVOKER_CLIENT_ID);
        match RequestHeaders::parse(&props) {
            Err(RequestFault::Respond { error, .. }) => {
                assert_eq!(error.kind, crate::error::ErrorKind::HeaderMissing);
            }
            other => panic!("expected respondable fault, got {other:?}"),
        }
    }

    #[test]
    fn response_roundtrip() {
        let cid = Uuid::new_v4();
        let mut headers = ResponseHeaders::ok(cid, HybridLogicalClock::new(2_000, 1, "oven-7"));
        headers.content_type = Some("application/json".into());
        headers.format_indicator = FormatIndicator::Utf8EncodedCharacterData;

        let props = headers.to_properties(Some(4));
        assert_eq!(props.user_property(PROP_STATUS), Some("200"));
        assert_eq!(props.message_expiry_interval, Some(4));

        let parsed = ResponseHeaders::parse(&props).unwrap();
        assert_eq!(parsed.correlation_id, cid);
        assert_eq!(parsed.status, StatusCode::Ok);
        assert!(!parsed.is_application_error);
        assert_eq!(parsed.timestamp, headers.timestamp);
    }

    #[test]
    fn error_response_roundtrip() {
        let cid = Uuid::new_v4();
        let mut error = ProtocolError::header_invalid("__ft", "junk", "unparseable fencing token");
        error.protocol_version = Some("2.0".into());
        error.supported_major_protocol_versions = Some(vec![1]);
        let headers =
            ResponseHeaders::for_error(cid, HybridLogicalClock::new(2_000, 1, "oven-7"), &error);
        let props = headers.to_properties(None);

        let parsed = ResponseHeaders::parse(&props).unwrap();
        assert_eq!(parsed.status, StatusCode::BadRequest);
        assert_eq!(parsed.invalid_property_name.as_deref(), Some("__ft"));
        assert_eq!(parsed.invalid_property_value.as_deref(), Some("junk"));
        assert_eq!(parsed.supported_major_versions, Some(vec![1]));
        assert_eq!(parsed.request_protocol_version.as_deref(), Some("2.0"));
    }

    #[test]
    fn response_missing_status_is_missing_header() {
        let cid = Uuid::new_v4();
        let headers = ResponseHeaders::ok(cid, HybridLogicalClock::new(1, 0, "n"));
        let mut props = headers.to_properties(None);
        props.user_properties.retain(|(k, _)| k != PROP_STATUS);
        let err = ResponseHeaders::parse(&props).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::HeaderMissing);
        assert_eq!(err.correlation_id, Some(cid));
    }

    #[test]
    fn response_unknown_status_is_invalid_header() {
        let headers = ResponseHeaders::ok(Uuid::new_v4(), HybridLogicalClock::new(1, 0, "n"));
        let mut props = headers.to_properties(None);
        props.user_properties.retain(|(k, _)| k != PROP_STATUS);
        props.push_user_property(PROP_STATUS, "418");
        let err = ResponseHeaders::parse(&props).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::HeaderInvalid);
    }

    #[test]
    fn version_parse_and_support() {
        let v: ProtocolVersion = "1.3".parse().unwrap();
        assert!(v.is_supported());
        let v: ProtocolVersion = "2.0".parse().unwrap();
        assert!(!v.is_supported());
        assert!("junk".parse::<ProtocolVersion>().is_err());
        assert!("1".parse::<ProtocolVersion>().is_err());
        assert_eq!(format_supported_majors(&[1, 2]), "1 2");
    }

    #[test]
    fn expiry_rounds_up() {
        assert_eq!(expiry_seconds(Duration::from_millis(1)), 1);
        assert_eq!(expiry_seconds(Duration::from_millis(1_500)), 2);
        assert_eq!(expiry_seconds(Duration::from_secs(10)), 10);
    }
}
