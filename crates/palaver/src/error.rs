//! Error taxonomy for the Palaver RPC engine.
//!
//! Every failure surfaced by the invoker or executor is a [`ProtocolError`]:
//! a kind plus the context fields needed to act on it (which header, which
//! timeout, which protocol version). Remote faults travel the wire as an
//! HTTP-style status code in the `__stat` user property; [`StatusCode`] and
//! the `from_wire`/`wire_status` pair implement that mapping in both
//! directions.

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

/// Classification of everything that can go wrong in an RPC exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required MQTT header or user property was absent.
    HeaderMissing,
    /// A header or user property was present but unparseable or unsupported.
    HeaderInvalid,
    /// Payload (de)serialization failed, or a payload was unexpectedly
    /// present or absent.
    PayloadInvalid,
    /// An operation ran out of time.
    Timeout,
    /// The caller cancelled the operation.
    Cancellation,
    /// Start-time misconfiguration of an invoker or executor.
    ConfigurationInvalid,
    /// A bad parameter on an individual call.
    ArgumentInvalid,
    /// The engine is in a state where the operation cannot proceed
    /// (clock drift beyond bounds, session loss).
    StateInvalid,
    /// A condition that should be impossible (counter overflow).
    InternalLogicError,
    /// A wrapped error that fits no other kind.
    UnknownError,
    /// The remote handler rejected the request content.
    InvocationError,
    /// The remote handler started executing and failed.
    ExecutionError,
    /// The underlying MQTT transport reported a failure.
    MqttError,
    /// The executor does not support the request's major protocol version.
    UnsupportedRequestVersion,
    /// The invoker does not support the response's major protocol version.
    UnsupportedResponseVersion,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::HeaderMissing => "missing header",
            ErrorKind::HeaderInvalid => "invalid header",
            ErrorKind::PayloadInvalid => "invalid payload",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancellation => "cancellation",
            ErrorKind::ConfigurationInvalid => "invalid configuration",
            ErrorKind::ArgumentInvalid => "invalid argument",
            ErrorKind::StateInvalid => "invalid state",
            ErrorKind::InternalLogicError => "internal logic error",
            ErrorKind::UnknownError => "unknown error",
            ErrorKind::InvocationError => "invocation error",
            ErrorKind::ExecutionError => "execution error",
            ErrorKind::MqttError => "mqtt error",
            ErrorKind::UnsupportedRequestVersion => "unsupported request version",
            ErrorKind::UnsupportedResponseVersion => "unsupported response version",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed set of HTTP-style status codes carried in `__stat`.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 200,
    NoContent = 204,
    BadRequest = 400,
    RequestTimeout = 408,
    UnsupportedMediaType = 415,
    UnprocessableContent = 422,
    InternalServerError = 500,
    ServiceUnavailable = 503,
    VersionNotSupported = 505,
}

impl StatusCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            200 => Some(StatusCode::Ok),
            204 => Some(StatusCode::NoContent),
            400 => Some(StatusCode::BadRequest),
            408 => Some(StatusCode::RequestTimeout),
            415 => Some(StatusCode::UnsupportedMediaType),
            422 => Some(StatusCode::UnprocessableContent),
            500 => Some(StatusCode::InternalServerError),
            503 => Some(StatusCode::ServiceUnavailable),
            505 => Some(StatusCode::VersionNotSupported),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn is_success(self) -> bool {
        matches!(self, StatusCode::Ok | StatusCode::NoContent)
    }
}

/// An RPC failure with full context.
///
/// Fields beyond `kind` are populated where they apply: a header fault names
/// the header, a timeout names which timeout elapsed, a version mismatch
/// carries both sides of the negotiation.
#[derive(Debug)]
pub struct ProtocolError {
    pub kind: ErrorKind,
    /// True when the fault originated in user handler code rather than
    /// the protocol engine.
    pub in_application: bool,
    /// True when the fault was detected before any network I/O happened.
    pub is_shallow: bool,
    /// True when the fault was detected by the remote peer and reported
    /// over the wire.
    pub is_remote: bool,
    pub message: Option<String>,
    pub nested: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub http_status_code: Option<u16>,
    pub header_name: Option<String>,
    pub header_value: Option<String>,
    pub timeout_name: Option<String>,
    pub timeout_value: Option<Duration>,
    pub property_name: Option<String>,
    pub property_value: Option<String>,
    pub command_name: Option<String>,
    pub protocol_version: Option<String>,
    pub supported_major_protocol_versions: Option<Vec<u16>>,
    pub correlation_id: Option<Uuid>,
}

impl ProtocolError {
    fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            in_application: false,
            is_shallow: false,
            is_remote: false,
            message: None,
            nested: None,
            http_status_code: None,
            header_name: None,
            header_value: None,
            timeout_name: None,
            timeout_value: None,
            property_name: None,
            property_value: None,
            command_name: None,
            protocol_version: None,
            supported_major_protocol_versions: None,
            correlation_id: None,
        }
    }

    pub fn header_missing(header_name: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::HeaderMissing);
        e.header_name = Some(header_name.into());
        e
    }

    pub fn header_invalid(
        header_name: impl Into<String>,
        header_value: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut e = Self::new(ErrorKind::HeaderInvalid);
        e.header_name = Some(header_name.into());
        e.header_value = Some(header_value.into());
        e.message = Some(message.into());
        e
    }

    pub fn payload_invalid(message: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::PayloadInvalid);
        e.message = Some(message.into());
        e
    }

    pub fn timeout(timeout_name: impl Into<String>, timeout_value: Duration) -> Self {
        let mut e = Self::new(ErrorKind::Timeout);
        e.timeout_name = Some(timeout_name.into());
        e.timeout_value = Some(timeout_value);
        e
    }

    pub fn cancellation(message: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::Cancellation);
        e.message = Some(message.into());
        e
    }

    /// Start-time misconfiguration. Shallow by definition.
    pub fn configuration_invalid(
        property_name: impl Into<String>,
        property_value: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut e = Self::new(ErrorKind::ConfigurationInvalid);
        e.is_shallow = true;
        e.property_name = Some(property_name.into());
        e.property_value = Some(property_value.into());
        e.message = Some(message.into());
        e
    }

    /// Bad per-call parameter. Shallow by definition.
    pub fn argument_invalid(
        property_name: impl Into<String>,
        property_value: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut e = Self::new(ErrorKind::ArgumentInvalid);
        e.is_shallow = true;
        e.property_name = Some(property_name.into());
        e.property_value = Some(property_value.into());
        e.message = Some(message.into());
        e
    }

    pub fn state_invalid(message: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::StateInvalid);
        e.message = Some(message.into());
        e
    }

    pub fn internal_logic(message: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::InternalLogicError);
        e.message = Some(message.into());
        e
    }

    pub fn unknown(nested: Box<dyn std::error::Error + Send + Sync>) -> Self {
        let mut e = Self::new(ErrorKind::UnknownError);
        e.nested = Some(nested);
        e
    }

    /// The user handler rejected the request. Application-level.
    pub fn invocation(message: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::InvocationError);
        e.in_application = true;
        e.message = Some(message.into());
        e
    }

    /// The user handler failed while executing. Application-level.
    pub fn execution(message: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::ExecutionError);
        e.in_application = true;
        e.message = Some(message.into());
        e
    }

    pub fn mqtt(message: impl Into<String>) -> Self {
        let mut e = Self::new(ErrorKind::MqttError);
        e.message = Some(message.into());
        e
    }

    /// Raised by the executor on a request whose major protocol version it
    /// does not speak.
    pub fn unsupported_request_version(
        request_version: impl Into<String>,
        supported_majors: Vec<u16>,
    ) -> Self {
        let mut e = Self::new(ErrorKind::UnsupportedRequestVersion);
        e.protocol_version = Some(request_version.into());
        e.supported_major_protocol_versions = Some(supported_majors);
        e
    }

    /// Raised by the invoker on a response whose major protocol version it
    /// does not speak.
    pub fn unsupported_response_version(
        response_version: impl Into<String>,
        supported_majors: Vec<u16>,
    ) -> Self {
        let mut e = Self::new(ErrorKind::UnsupportedResponseVersion);
        e.protocol_version = Some(response_version.into());
        e.supported_major_protocol_versions = Some(supported_majors);
        e
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_nested(mut self, nested: Box<dyn std::error::Error + Send + Sync>) -> Self {
        self.nested = Some(nested);
        self
    }

    pub fn with_command(mut self, command_name: impl Into<String>) -> Self {
        self.command_name = Some(command_name.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn shallow(mut self) -> Self {
        self.is_shallow = true;
        self
    }

    /// The status code this error maps to when it is reported over the
    /// wire by an executor. `None` means the fault is local-only and never
    /// becomes a response.
    pub fn wire_status(&self) -> Option<StatusCode> {
        match self.kind {
            ErrorKind::HeaderMissing => Some(StatusCode::BadRequest),
            ErrorKind::HeaderInvalid => {
                // Unsupported content type gets its own code so invokers
                // can distinguish it from a merely malformed header.
                if self.http_status_code == Some(415) {
                    Some(StatusCode::UnsupportedMediaType)
                } else {
                    Some(StatusCode::BadRequest)
                }
            }
            ErrorKind::PayloadInvalid => Some(StatusCode::BadRequest),
            ErrorKind::Timeout => Some(StatusCode::RequestTimeout),
            ErrorKind::StateInvalid => Some(StatusCode::ServiceUnavailable),
            ErrorKind::InternalLogicError | ErrorKind::UnknownError => {
                Some(StatusCode::InternalServerError)
            }
            ErrorKind::InvocationError => Some(StatusCode::UnprocessableContent),
            ErrorKind::ExecutionError => Some(StatusCode::InternalServerError),
            ErrorKind::UnsupportedRequestVersion => Some(StatusCode::VersionNotSupported),
            ErrorKind::Cancellation
            | ErrorKind::ConfigurationInvalid
            | ErrorKind::ArgumentInvalid
            | ErrorKind::MqttError
            | ErrorKind::UnsupportedResponseVersion => None,
        }
    }

    /// Reconstruct an error from a response's wire fields, as seen by the
    /// invoker. `is_application` is the `__apErr` flag; `invalid_name` and
    /// `invalid_value` are `__propName`/`__propVal`.
    pub fn from_wire(
        status: StatusCode,
        is_application: bool,
        status_message: Option<String>,
        invalid_name: Option<String>,
        invalid_value: Option<String>,
    ) -> Self {
        let kind = match status {
            StatusCode::Ok | StatusCode::NoContent => ErrorKind::UnknownError,
            StatusCode::BadRequest => {
                if invalid_name.is_some() {
                    if invalid_value.is_some() {
                        ErrorKind::HeaderInvalid
                    } else {
                        ErrorKind::HeaderMissing
                    }
                } else {
                    ErrorKind::PayloadInvalid
                }
            }
            StatusCode::RequestTimeout => ErrorKind::Timeout,
            StatusCode::UnsupportedMediaType => ErrorKind::HeaderInvalid,
            StatusCode::UnprocessableContent => ErrorKind::InvocationError,
            StatusCode::InternalServerError => {
                if is_application {
                    ErrorKind::ExecutionError
                } else if invalid_name.is_some() {
                    ErrorKind::InternalLogicError
                } else {
                    ErrorKind::UnknownError
                }
            }
            StatusCode::ServiceUnavailable => ErrorKind::StateInvalid,
            StatusCode::VersionNotSupported => ErrorKind::UnsupportedRequestVersion,
        };

        let mut e = Self::new(kind);
        e.is_remote = true;
        e.in_application = is_application;
        e.http_status_code = Some(status.to_u16());
        e.message = status_message;
        match kind {
            ErrorKind::Timeout => {
                e.timeout_name = invalid_name;
                e.timeout_value = invalid_value
                    .as_deref()
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_millis);
            }
            _ => {
                e.header_name = invalid_name.clone();
                e.header_value = invalid_value.clone();
                e.property_name = invalid_name;
                e.property_value = invalid_value;
            }
        }
        e
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(cmd) = &self.command_name {
            write!(f, " [{cmd}]")?;
        }
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        if let Some(name) = &self.header_name {
            write!(f, " (header {name}")?;
            if let Some(value) = &self.header_value {
                write!(f, "={value}")?;
            }
            write!(f, ")")?;
        }
        if let Some(name) = &self.timeout_name {
            write!(f, " ({name}")?;
            if let Some(value) = &self.timeout_value {
                write!(f, "={value:?}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.nested
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}
