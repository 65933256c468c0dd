//! Command invoker: the calling half of the RPC engine.
//!
//! An invoker turns `invoke(payload)` into a correlated QoS-1 publish and a
//! wait on the matching response. A background routing task owns the
//! response subscription and completes pending entries by correlation id;
//! callers never see each other's responses, duplicates, or strays.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{ProtocolError, StatusCode};
use crate::headers::{
    RequestHeaders, ResponseHeaders, HEADER_CONTENT_TYPE, MAX_WIRE_TIMEOUT, PROTOCOL_VERSION,
    SUPPORTED_MAJOR_VERSIONS,
};
use crate::hlc::{HlcClock, HybridLogicalClock};
use crate::payload::{DeserializeError, PayloadSerialize};
use crate::pending::PendingRequests;
use crate::topic::{
    self, TokenMap, TopicPattern, TOKEN_COMMAND_NAME, TOKEN_EXECUTOR_ID, TOKEN_INVOKER_CLIENT_ID,
};
use crate::transport::{InboundPublish, MqttTransport, MqttVersion, OutboundPublish, QoS, SessionEvent};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Invoker configuration. Build with [`InvokerOptions::new`] plus the
/// `with_*` methods; everything is validated at [`CommandInvoker::new`].
#[derive(Debug, Clone)]
pub struct InvokerOptions {
    command_name: String,
    request_topic_pattern: String,
    response_topic_pattern: Option<String>,
    response_topic_prefix: Option<String>,
    response_topic_suffix: Option<String>,
    topic_namespace: Option<String>,
    default_timeout: Duration,
    topic_tokens: TokenMap,
}

impl InvokerOptions {
    pub fn new(command_name: impl Into<String>, request_topic_pattern: impl Into<String>) -> Self {
        Self {
            command_name: command_name.into(),
            request_topic_pattern: request_topic_pattern.into(),
            response_topic_pattern: None,
            response_topic_prefix: None,
            response_topic_suffix: None,
            topic_namespace: None,
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
            topic_tokens: TokenMap::new(),
        }
    }

    /// Full override for the response topic; prefix and suffix are ignored
    /// when this is set.
    pub fn with_response_topic_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.response_topic_pattern = Some(pattern.into());
        self
    }

    pub fn with_response_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.response_topic_prefix = Some(prefix.into());
        self
    }

    pub fn with_response_topic_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.response_topic_suffix = Some(suffix.into());
        self
    }

    pub fn with_topic_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.topic_namespace = Some(namespace.into());
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_topic_token(mut self, token: impl Into<String>, value: impl Into<String>) -> Self {
        self.topic_tokens.insert(token.into(), value.into());
        self
    }

    /// The response pattern: an explicit override, or the request pattern
    /// wrapped in prefix/suffix. With neither configured, responses land
    /// under `clients/{invokerClientId}/...` so each invoker listens on its
    /// own slice of the topic space.
    fn response_pattern_string(&self) -> String {
        if let Some(pattern) = &self.response_topic_pattern {
            return pattern.clone();
        }
        let (prefix, suffix) = match (&self.response_topic_prefix, &self.response_topic_suffix) {
            (None, None) => (Some(format!("clients/{{{TOKEN_INVOKER_CLIENT_ID}}}")), None),
            (prefix, suffix) => (prefix.clone(), suffix.clone()),
        };
        let mut pattern = self.request_topic_pattern.clone();
        if let Some(prefix) = prefix {
            pattern = format!("{prefix}/{pattern}");
        }
        if let Some(suffix) = suffix {
            pattern = format!("{pattern}/{suffix}");
        }
        pattern
    }
}

/// Per-call parameters for [`CommandInvoker::invoke`].
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Replacement for `{executorId}` in the request topic. Required when
    /// the pattern contains that token.
    pub executor_id: Option<String>,
    /// Override of the configured default timeout.
    pub timeout: Option<Duration>,
    pub fencing_token: Option<HybridLogicalClock>,
    /// Extra per-call token replacements.
    pub topic_tokens: TokenMap,
}

/// The invoker engine.
pub struct CommandInvoker<TReq, TResp> {
    transport: Arc<dyn MqttTransport>,
    pending: PendingRequests,
    clock: Arc<HlcClock>,
    command_name: String,
    request_pattern: TopicPattern,
    response_pattern: TopicPattern,
    base_tokens: TokenMap,
    namespace: Option<String>,
    default_timeout: Duration,
    response_filter: String,
    subscribed: OnceCell<()>,
    session_lost: Arc<AtomicBool>,
    router: JoinHandle<()>,
    _marker: PhantomData<fn(TReq) -> TResp>,
}

impl<TReq, TResp> CommandInvoker<TReq, TResp>
where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize,
{
    pub fn new(
        transport: Arc<dyn MqttTransport>,
        options: InvokerOptions,
    ) -> Result<Self, ProtocolError> {
        if transport.protocol_version() != MqttVersion::V5 {
            return Err(ProtocolError::configuration_invalid(
                "mqttVersion",
                "v3",
                "the RPC protocol requires an MQTT v5 transport",
            ));
        }
        if options.command_name.is_empty() {
            return Err(ProtocolError::configuration_invalid(
                "commandName",
                "",
                "command name must not be empty",
            ));
        }
        if options.default_timeout.is_zero() || options.default_timeout > MAX_WIRE_TIMEOUT {
            return Err(ProtocolError::configuration_invalid(
                "defaultTimeout",
                format!("{:?}", options.default_timeout),
                "timeout must be positive and fit in u32 seconds",
            ));
        }
        if let Some(ns) = &options.topic_namespace {
            topic::validate_namespace(ns)?;
        }
        topic::validate_token_map(&options.topic_tokens)?;
        let request_pattern = TopicPattern::new(&options.request_topic_pattern)?;
        let response_pattern = TopicPattern::new(options.response_pattern_string())?;

        let client_id = transport.client_id().to_string();
        let mut base_tokens = options.topic_tokens.clone();
        base_tokens
            .entry(TOKEN_COMMAND_NAME.to_string())
            .or_insert_with(|| options.command_name.clone());
        base_tokens.insert(TOKEN_INVOKER_CLIENT_ID.to_string(), client_id.clone());

        let mut response_filter = response_pattern.to_filter(&base_tokens);
        if let Some(ns) = &options.topic_namespace {
            response_filter = topic::prepend_namespace(&response_filter, ns);
        }

        let pending = PendingRequests::new();
        let clock = Arc::new(HlcClock::new(&client_id));
        let session_lost = Arc::new(AtomicBool::new(false));

        // Register delivery before anything gets published so no response
        // can slip past; the actual subscribe happens on first invoke.
        let inbound = transport.register_filter(&response_filter);
        let session = transport.session_events();
        let router = tokio::spawn(route_responses(
            inbound,
            session,
            pending.clone(),
            clock.clone(),
            session_lost.clone(),
            options.command_name.clone(),
        ));

        Ok(Self {
            transport,
            pending,
            clock,
            command_name: options.command_name,
            request_pattern,
            response_pattern,
            base_tokens,
            namespace: options.topic_namespace,
            default_timeout: options.default_timeout,
            response_filter,
            subscribed: OnceCell::new(),
            session_lost,
            router,
            _marker: PhantomData,
        })
    }

    pub fn command_name(&self) -> &str {
        &self.command_name
    }

    /// Invoke the command and wait for its response or the timeout.
    pub async fn invoke(
        &self,
        payload: TReq,
        options: InvokeOptions,
    ) -> Result<TResp, ProtocolError> {
        if self.session_lost.load(Ordering::Relaxed) {
            return Err(ProtocolError::state_invalid("session lost")
                .with_command(self.command_name.clone()));
        }

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        if timeout.is_zero() || timeout > MAX_WIRE_TIMEOUT {
            return Err(ProtocolError::argument_invalid(
                "timeout",
                format!("{timeout:?}"),
                "timeout must be positive and fit in u32 seconds",
            )
            .with_command(self.command_name.clone()));
        }

        let mut tokens = self.base_tokens.clone();
        for (token, value) in &options.topic_tokens {
            tokens.insert(token.clone(), value.clone());
        }
        if let Some(executor_id) = &options.executor_id {
            tokens.insert(TOKEN_EXECUTOR_ID.to_string(), executor_id.clone());
        }
        if self.request_pattern.has_token(TOKEN_EXECUTOR_ID)
            && !tokens.contains_key(TOKEN_EXECUTOR_ID)
        {
            return Err(ProtocolError::argument_invalid(
                "executorId",
                "",
                "the request topic pattern requires an executor id",
            )
            .with_command(self.command_name.clone()));
        }

        let request_topic = self.apply_namespace(self.request_pattern.resolve(&tokens)?);
        let response_topic = self.apply_namespace(self.response_pattern.resolve(&tokens)?);

        self.ensure_subscribed().await?;

        let serialized = payload.serialize().map_err(|e| {
            ProtocolError::payload_invalid(e.to_string())
                .shallow()
                .with_command(self.command_name.clone())
        })?;

        let correlation_id = Uuid::new_v4();
        let timestamp = self.clock.stamp()?;
        let client_id = self.transport.client_id().to_string();
        let headers = RequestHeaders {
            correlation_id,
            response_topic,
            message_expiry: timeout,
            content_type: (!serialized.content_type.is_empty())
                .then(|| serialized.content_type.clone()),
            format_indicator: serialized.format_indicator,
            timestamp,
            fencing_token: options.fencing_token.clone(),
            invoker_client_id: client_id.clone(),
            protocol_version: PROTOCOL_VERSION,
            partition: client_id,
        };

        // The guard unregisters on every exit path below, so a late
        // response after timeout or cancellation finds no entry.
        let (_guard, receiver) = self.pending.register(correlation_id)?;
        let deadline = Instant::now() + timeout;

        trace!(
            command = %self.command_name,
            %correlation_id,
            topic = %request_topic,
            "publishing request"
        );
        let completion = self
            .transport
            .publish(OutboundPublish {
                topic: request_topic,
                qos: QoS::AtLeastOnce,
                payload: Bytes::from(serialized.payload),
                properties: headers.to_properties(),
            })
            .await
            .map_err(|e| {
                ProtocolError::mqtt("request publish failed")
                    .with_nested(Box::new(e))
                    .with_command(self.command_name.clone())
                    .with_correlation(correlation_id)
            })?;

        let puback = tokio::time::timeout_at(deadline.into(), completion.wait())
            .await
            .map_err(|_| self.timeout_error(timeout, correlation_id))?;
        puback.map_err(|e| {
            ProtocolError::mqtt("request publish unacknowledged")
                .with_nested(Box::new(e))
                .with_command(self.command_name.clone())
                .with_correlation(correlation_id)
        })?;

        let completion = match tokio::time::timeout_at(deadline.into(), receiver).await {
            Err(_) => {
                debug!(command = %self.command_name, %correlation_id, "invocation timed out");
                return Err(self.timeout_error(timeout, correlation_id));
            }
            Ok(Err(_)) => {
                return Err(ProtocolError::internal_logic("pending entry dropped")
                    .with_command(self.command_name.clone())
                    .with_correlation(correlation_id));
            }
            Ok(Ok(completion)) => completion,
        };

        let (response, body) = completion.map_err(|e| e.with_command(self.command_name.clone()))?;
        self.unpack(response, body)
    }

    /// Unsubscribe the response filter and stop the routing task.
    pub async fn shutdown(&self) -> Result<(), ProtocolError> {
        if self.subscribed.initialized() {
            self.transport
                .unsubscribe(&self.response_filter)
                .await
                .map_err(|e| {
                    ProtocolError::mqtt("response unsubscribe failed")
                        .with_nested(Box::new(e))
                        .with_command(self.command_name.clone())
                })?;
        }
        self.router.abort();
        Ok(())
    }

    fn apply_namespace(&self, topic: String) -> String {
        match &self.namespace {
            Some(ns) => topic::prepend_namespace(&topic, ns),
            None => topic,
        }
    }

    async fn ensure_subscribed(&self) -> Result<(), ProtocolError> {
        self.subscribed
            .get_or_try_init(|| async {
                let granted = self
                    .transport
                    .subscribe(&self.response_filter, QoS::AtLeastOnce)
                    .await
                    .map_err(|e| {
                        ProtocolError::mqtt("response subscribe failed")
                            .with_nested(Box::new(e))
                            .with_command(self.command_name.clone())
                    })?;
                if granted < QoS::AtLeastOnce {
                    return Err(ProtocolError::mqtt(format!(
                        "broker granted QoS {granted:?} for response filter"
                    ))
                    .with_command(self.command_name.clone()));
                }
                info!(
                    command = %self.command_name,
                    filter = %self.response_filter,
                    "response subscription established"
                );
                Ok(())
            })
            .await
            .map(|_| ())
    }

    fn timeout_error(&self, timeout: Duration, correlation_id: Uuid) -> ProtocolError {
        ProtocolError::timeout("commandTimeout", timeout)
            .with_command(self.command_name.clone())
            .with_correlation(correlation_id)
    }

    fn unpack(&self, response: ResponseHeaders, body: Bytes) -> Result<TResp, ProtocolError> {
        if response.status.is_success() {
            return TResp::deserialize(
                &body,
                response.content_type.as_deref(),
                response.format_indicator,
            )
            .map_err(|e| {
                let error = match e {
                    DeserializeError::UnsupportedContentType(ct) => {
                        let mut err = ProtocolError::header_invalid(
                            HEADER_CONTENT_TYPE,
                            ct,
                            "response content type not supported",
                        );
                        err.http_status_code = Some(415);
                        err
                    }
                    other => ProtocolError::payload_invalid(other.to_string()),
                };
                error
                    .with_command(self.command_name.clone())
                    .with_correlation(response.correlation_id)
            });
        }

        let mut error = ProtocolError::from_wire(
            response.status,
            response.is_application_error,
            response.status_message.clone(),
            response.invalid_property_name.clone(),
            response.invalid_property_value.clone(),
        );
        if response.status == StatusCode::VersionNotSupported {
            error.protocol_version = response.request_protocol_version.clone();
            error.supported_major_protocol_versions = response.supported_major_versions.clone();
        }
        Err(error
            .with_command(self.command_name.clone())
            .with_correlation(response.correlation_id))
    }
}

impl<TReq, TResp> Drop for CommandInvoker<TReq, TResp> {
    fn drop(&mut self) {
        self.router.abort();
    }
}

/// The routing task: acks every response on receipt, matches it to a
/// pending invocation by correlation id alone, and fails everything when
/// the session is lost.
async fn route_responses(
    mut inbound: tokio::sync::mpsc::UnboundedReceiver<InboundPublish>,
    mut session: tokio::sync::broadcast::Receiver<SessionEvent>,
    pending: PendingRequests,
    clock: Arc<HlcClock>,
    session_lost: Arc<AtomicBool>,
    command_name: String,
) {
    loop {
        tokio::select! {
            event = session.recv() => {
                if let Ok(SessionEvent::SessionLost) = event {
                    warn!(command = %command_name, "broker session lost; failing pending invocations");
                    session_lost.store(true, Ordering::Relaxed);
                    pending.fail_all(|| ProtocolError::mqtt("session lost"));
                }
            }

            received = inbound.recv() => {
                let Some(publish) = received else {
                    debug!(command = %command_name, "response stream ended; router exiting");
                    return;
                };
                let InboundPublish { payload, properties, ack, .. } = publish;
                // Responses are processed immediately; nothing gates their ack.
                ack.ack();

                let response = match ResponseHeaders::parse(&properties) {
                    Ok(response) => response,
                    Err(error) => {
                        warn!(command = %command_name, %error, "discarding unparseable response");
                        continue;
                    }
                };
                let correlation_id = response.correlation_id;

                if !response.protocol_version.is_supported() {
                    let error = ProtocolError::unsupported_response_version(
                        response.protocol_version.to_string(),
                        SUPPORTED_MAJOR_VERSIONS.to_vec(),
                    );
                    pending.complete(&correlation_id, Err(error));
                    continue;
                }

                if let Some(ts) = &response.timestamp {
                    if let Err(error) = clock.observe(ts) {
                        pending.complete(&correlation_id, Err(error));
                        continue;
                    }
                }

                if !pending.complete(&correlation_id, Ok((response, payload))) {
                    // Unknown correlation id or a duplicate of an already
                    // completed invocation: dropped, never surfaced.
                    debug!(
                        command = %command_name,
                        %correlation_id,
                        "discarding response with no pending invocation"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Json;
    use crate::transport::{PublishCompletion, TransportError};
    use async_trait::async_trait;
    use tokio::sync::{broadcast, mpsc};

    struct NullTransport {
        client_id: String,
        version: MqttVersion,
        session_tx: broadcast::Sender<SessionEvent>,
    }

    impl NullTransport {
        fn new(version: MqttVersion) -> Arc<Self> {
            Arc::new(Self {
                client_id: "invoker-1".into(),
                version,
                session_tx: broadcast::channel(4).0,
            })
        }
    }

    #[async_trait]
    impl MqttTransport for NullTransport {
        fn client_id(&self) -> &str {
            &self.client_id
        }

        fn protocol_version(&self) -> MqttVersion {
            self.version
        }

        async fn publish(
            &self,
            _publish: OutboundPublish,
        ) -> Result<PublishCompletion, TransportError> {
            Ok(PublishCompletion::resolved())
        }

        async fn subscribe(&self, _filter: &str, qos: QoS) -> Result<QoS, TransportError> {
            Ok(qos)
        }

        async fn unsubscribe(&self, _filter: &str) -> Result<(), TransportError> {
            Ok(())
        }

        fn register_filter(&self, _filter: &str) -> mpsc::UnboundedReceiver<InboundPublish> {
            mpsc::unbounded_channel().1
        }

        fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
            self.session_tx.subscribe()
        }
    }

    type Invoker = CommandInvoker<Json<String>, Json<String>>;

    #[tokio::test]
    async fn default_response_filter_is_invoker_scoped() {
        let invoker = Invoker::new(
            NullTransport::new(MqttVersion::V5),
            InvokerOptions::new("echo", "devices/{executorId}/commands/{commandName}"),
        )
        .unwrap();
        assert_eq!(
            invoker.response_filter,
            "clients/invoker-1/devices/+/commands/echo"
        );
    }

    #[tokio::test]
    async fn explicit_response_pattern_overrides_prefix() {
        let invoker = Invoker::new(
            NullTransport::new(MqttVersion::V5),
            InvokerOptions::new("echo", "devices/{executorId}/commands/{commandName}")
                .with_response_topic_prefix("ignored")
                .with_response_topic_pattern("answers/{invokerClientId}/{commandName}"),
        )
        .unwrap();
        assert_eq!(invoker.response_filter, "answers/invoker-1/echo");
    }

    #[tokio::test]
    async fn namespace_prefixes_the_filter() {
        let invoker = Invoker::new(
            NullTransport::new(MqttVersion::V5),
            InvokerOptions::new("echo", "devices/{executorId}/commands/{commandName}")
                .with_topic_namespace("tenant-9"),
        )
        .unwrap();
        assert_eq!(
            invoker.response_filter,
            "tenant-9/clients/invoker-1/devices/+/commands/echo"
        );
    }

    #[tokio::test]
    async fn rejects_bad_configuration() {
        let transport = NullTransport::new(MqttVersion::V5);
        assert!(Invoker::new(transport.clone(), InvokerOptions::new("", "a/b")).is_err());
        assert!(Invoker::new(transport.clone(), InvokerOptions::new("echo", "")).is_err());
        assert!(Invoker::new(
            transport.clone(),
            InvokerOptions::new("echo", "a/b").with_default_timeout(Duration::ZERO)
        )
        .is_err());
        assert!(Invoker::new(
            transport,
            InvokerOptions::new("echo", "a/b").with_topic_namespace("bad ns")
        )
        .is_err());
        assert!(Invoker::new(
            NullTransport::new(MqttVersion::V3),
            InvokerOptions::new("echo", "a/b")
        )
        .is_err());
    }

    #[tokio::test]
    async fn invoke_requires_executor_id_when_pattern_has_token() {
        let invoker = Invoker::new(
            NullTransport::new(MqttVersion::V5),
            InvokerOptions::new("echo", "devices/{executorId}/commands/{commandName}"),
        )
        .unwrap();
        let err = invoker
            .invoke(Json("hi".to_string()), InvokeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ArgumentInvalid);
        assert_eq!(err.property_name.as_deref(), Some("executorId"));
    }

    #[tokio::test]
    async fn invoke_rejects_out_of_range_timeout() {
        let invoker = Invoker::new(
            NullTransport::new(MqttVersion::V5),
            InvokerOptions::new("echo", "commands/{commandName}"),
        )
        .unwrap();
        let err = invoker
            .invoke(
                Json("hi".to_string()),
                InvokeOptions {
                    timeout: Some(Duration::ZERO),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ArgumentInvalid);
    }
}
