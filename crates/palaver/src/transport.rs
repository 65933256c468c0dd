//! The narrow MQTT v5 capability set the engine consumes.
//!
//! The engine never owns a socket. It is handed anything implementing
//! [`MqttTransport`] (a session-managing MQTT v5 client in production, an
//! in-memory broker in tests) and uses exactly six capabilities: publish,
//! subscribe, unsubscribe, filtered message delivery, delayed acks, and
//! session-loss notification.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::payload::FormatIndicator;

/// MQTT quality-of-service levels. All protocol traffic uses
/// [`QoS::AtLeastOnce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// Protocol revision of the underlying client. The engine requires
/// [`MqttVersion::V5`]; request/response semantics lean on v5-only
/// properties (correlation data, response topic, message expiry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttVersion {
    V3,
    V5,
}

/// MQTT v5 publish properties, limited to the ones the protocol reads.
#[derive(Debug, Clone, Default)]
pub struct PublishProperties {
    pub content_type: Option<String>,
    pub payload_format_indicator: Option<FormatIndicator>,
    pub correlation_data: Option<Bytes>,
    pub response_topic: Option<String>,
    /// Seconds until the broker may discard the message.
    pub message_expiry_interval: Option<u32>,
    pub user_properties: Vec<(String, String)>,
}

impl PublishProperties {
    pub fn user_property(&self, key: &str) -> Option<&str> {
        self.user_properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn push_user_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.user_properties.push((key.into(), value.into()));
    }
}

/// A publish on its way to the broker.
#[derive(Debug, Clone)]
pub struct OutboundPublish {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
    pub properties: PublishProperties,
}

/// A publish delivered by the broker. Holds the [`AckHandle`] whose release
/// sends the PUBACK; the executor defers that until processing finishes.
pub struct InboundPublish {
    pub topic: String,
    pub payload: Bytes,
    pub properties: PublishProperties,
    pub ack: AckHandle,
}

impl std::fmt::Debug for InboundPublish {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundPublish")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

/// Releases the transport-level acknowledgement of one received publish.
///
/// Dropping the handle without calling [`AckHandle::ack`] leaves the packet
/// unacknowledged; the broker will redeliver it on the next reconnect.
pub struct AckHandle(Option<Box<dyn FnOnce() + Send>>);

impl AckHandle {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(release)))
    }

    /// A handle with nothing to release (QoS 0 deliveries).
    pub fn noop() -> Self {
        Self(None)
    }

    pub fn ack(mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AckHandle")
            .field(&self.0.as_ref().map(|_| "pending").unwrap_or("noop"))
            .finish()
    }
}

/// Resolves when the broker acknowledges a QoS-1 publish of ours.
#[derive(Debug)]
pub struct PublishCompletion(oneshot::Receiver<Result<(), TransportError>>);

impl PublishCompletion {
    /// Create an unresolved completion plus the sender that resolves it.
    pub fn pending() -> (oneshot::Sender<Result<(), TransportError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self(rx))
    }

    /// An already-acknowledged completion.
    pub fn resolved() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        Self(rx)
    }

    pub async fn wait(self) -> Result<(), TransportError> {
        self.0.await.map_err(|_| TransportError::Closed)?
    }
}

/// Session-level notifications the engines subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The broker accepted a reconnect with `session_present = false`:
    /// subscriptions and unacked state from the prior session are gone.
    SessionLost,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("publish rejected: {0}")]
    Publish(String),
    #[error("subscribe rejected: {0}")]
    Subscribe(String),
    #[error("unsubscribe rejected: {0}")]
    Unsubscribe(String),
    #[error("transport closed")]
    Closed,
}

/// The capability set consumed from any MQTT v5 client.
///
/// Delivery contract: `register_filter` returns the receiving end of the
/// transport's dispatch for one filter; every matching publish arrives in
/// broker order, each carrying its own [`AckHandle`]. Ack release order is
/// the caller's responsibility.
#[async_trait]
pub trait MqttTransport: Send + Sync + 'static {
    fn client_id(&self) -> &str;

    fn protocol_version(&self) -> MqttVersion;

    async fn publish(&self, publish: OutboundPublish) -> Result<PublishCompletion, TransportError>;

    /// Subscribe and return the granted QoS.
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<QoS, TransportError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError>;

    fn register_filter(&self, filter: &str) -> mpsc::UnboundedReceiver<InboundPublish>;

    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}
