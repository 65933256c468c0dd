//! palaver - request/response RPC over an MQTT v5 broker.
//!
//! Two endpoints talk through a broker: a [`CommandInvoker`] publishes a
//! request with a fresh correlation id and waits; a [`CommandExecutor`]
//! receives it, runs a user handler exactly once per correlation id, and
//! publishes the response back. Everything rides on QoS-1 publishes plus
//! v5 properties (correlation data, response topic, message expiry), with
//! effectively-once semantics built from four parts:
//!
//! - a correlation-keyed [`cache::ResponseCache`] that replays responses to
//!   redelivered requests instead of re-executing,
//! - client-supplied timeouts mirrored into broker message expiry,
//! - bounded executor concurrency with receipt-ordered request acks
//!   ([`ack_queue::AckQueue`]),
//! - monotonic [`hlc::HybridLogicalClock`] stamps on every message.
//!
//! The MQTT client itself stays outside: anything implementing
//! [`transport::MqttTransport`] plugs in. Payload codecs enter through
//! [`payload::PayloadSerialize`].

pub mod ack_queue;
pub mod cache;
pub mod error;
pub mod executor;
pub mod headers;
pub mod hlc;
pub mod invoker;
pub mod payload;
pub mod pending;
pub mod topic;
pub mod transport;

pub use error::{ErrorKind, ProtocolError, StatusCode};
pub use executor::{
    CommandExecutor, CommandHandler, CommandRequest, CommandResponse, ExecutorOptions,
    HandlerError,
};
pub use hlc::{HlcClock, HybridLogicalClock};
pub use invoker::{CommandInvoker, InvokeOptions, InvokerOptions};
pub use payload::{FormatIndicator, Json, PayloadSerialize, RawBytes, SerializedPayload};
pub use topic::TopicPattern;
pub use transport::{
    AckHandle, InboundPublish, MqttTransport, MqttVersion, OutboundPublish, PublishCompletion,
    PublishProperties, QoS, SessionEvent, TransportError,
};
