//! In-memory broker standing in for an MQTT v5 session.
//!
//! Routes publishes to every client whose subscribed filter matches,
//! records every publish and every PUBACK release, and lets tests inject
//! hand-built packets, replay deliveries, and drop sessions.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use palaver::topic::filter_matches;
use palaver::transport::{
    AckHandle, InboundPublish, MqttTransport, MqttVersion, OutboundPublish, PublishCompletion,
    QoS, SessionEvent, TransportError,
};

pub struct MemoryBroker {
    clients: Mutex<Vec<Arc<ClientCore>>>,
    publish_log: Mutex<Vec<OutboundPublish>>,
}

struct ClientCore {
    client_id: String,
    registered: Mutex<Vec<(String, mpsc::UnboundedSender<InboundPublish>)>>,
    subscribed: Mutex<HashSet<String>>,
    granted_qos: Mutex<QoS>,
    session_tx: broadcast::Sender<SessionEvent>,
    ack_log: Mutex<Vec<Option<Uuid>>>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(Vec::new()),
            publish_log: Mutex::new(Vec::new()),
        })
    }

    /// Attach a new MQTT v5 client with the given client id.
    pub fn client(self: &Arc<Self>, client_id: &str) -> Arc<MemoryTransport> {
        let core = Arc::new(ClientCore {
            client_id: client_id.to_string(),
            registered: Mutex::new(Vec::new()),
            subscribed: Mutex::new(HashSet::new()),
            granted_qos: Mutex::new(QoS::AtLeastOnce),
            session_tx: broadcast::channel(8).0,
            ack_log: Mutex::new(Vec::new()),
        });
        self.clients.lock().unwrap().push(core.clone());
        Arc::new(MemoryTransport {
            broker: self.clone(),
            core,
            version: MqttVersion::V5,
        })
    }

    /// Deliver a publish to every matching subscriber without going through
    /// any client. Routing the same publish twice models a QoS-1 redelivery.
    pub fn route(&self, publish: &OutboundPublish) {
        let clients: Vec<_> = self.clients.lock().unwrap().clone();
        for client in clients {
            client.deliver(publish);
        }
    }

    /// Every publish any client has sent, in order.
    pub fn published(&self) -> Vec<OutboundPublish> {
        self.publish_log.lock().unwrap().clone()
    }
}

impl ClientCore {
    fn deliver(self: &Arc<Self>, publish: &OutboundPublish) {
        let subscribed = self.subscribed.lock().unwrap().clone();
        let registered = self.registered.lock().unwrap().clone();
        for (filter, tx) in registered {
            if !subscribed.contains(&filter) || !filter_matches(&filter, &publish.topic) {
                continue;
            }
            let correlation = publish
                .properties
                .correlation_data
                .as_deref()
                .and_then(|data| Uuid::from_slice(data).ok());
            let me = self.clone();
            let ack = AckHandle::new(move || {
                me.ack_log.lock().unwrap().push(correlation);
            });
            let _ = tx.send(InboundPublish {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
                properties: publish.properties.clone(),
                ack,
            });
        }
    }
}

pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
    core: Arc<ClientCore>,
    version: MqttVersion,
}

impl MemoryTransport {
    /// Correlation ids this client has acked, in PUBACK order.
    pub fn ack_log(&self) -> Vec<Option<Uuid>> {
        self.core.ack_log.lock().unwrap().clone()
    }

    /// Simulate a reconnect that came back with `session_present = false`.
    pub fn lose_session(&self) {
        let _ = self.core.session_tx.send(SessionEvent::SessionLost);
    }

    /// Change what QoS the broker grants on subscribe.
    pub fn set_granted_qos(&self, qos: QoS) {
        *self.core.granted_qos.lock().unwrap() = qos;
    }

    /// Block until this client holds at least one subscription.
    pub async fn wait_until_subscribed(&self) {
        loop {
            if !self.core.subscribed.lock().unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

/// Shared-subscription group prefixes are broker routing, not topic
/// matching: store the bare filter.
fn strip_share(filter: &str) -> &str {
    filter
        .strip_prefix("$share/")
        .and_then(|rest| rest.split_once('/'))
        .map(|(_, bare)| bare)
        .unwrap_or(filter)
}

#[async_trait]
impl MqttTransport for MemoryTransport {
    fn client_id(&self) -> &str {
        &self.core.client_id
    }

    fn protocol_version(&self) -> MqttVersion {
        self.version
    }

    async fn publish(&self, publish: OutboundPublish) -> Result<PublishCompletion, TransportError> {
        self.broker.publish_log.lock().unwrap().push(publish.clone());
        self.broker.route(&publish);
        Ok(PublishCompletion::resolved())
    }

    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<QoS, TransportError> {
        self.core
            .subscribed
            .lock()
            .unwrap()
            .insert(strip_share(filter).to_string());
        Ok(*self.core.granted_qos.lock().unwrap())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.core.subscribed.lock().unwrap().remove(strip_share(filter));
        Ok(())
    }

    fn register_filter(&self, filter: &str) -> mpsc::UnboundedReceiver<InboundPublish> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.core
            .registered
            .lock()
            .unwrap()
            .push((filter.to_string(), tx));
        rx
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.session_tx.subscribe()
    }
}
