//! Command executor: the receiving half of the RPC engine.
//!
//! One executor serves one command. Its run loop receives requests from the
//! transport in broker order, enqueues each request's ack into the ordered
//! ack queue immediately, and hands the rest of the pipeline to a task:
//! validate headers, deduplicate against the response cache, acquire a
//! concurrency permit, run the user handler under a cancellation bound,
//! publish the response, and only then mark the request's ack releasable.
//! Responses may leave out of order; request acks never do.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ack_queue::AckQueue;
use crate::cache::{CachedResponse, Reservation, ReservationGuard, ResponseCache};
use crate::error::ProtocolError;
use crate::headers::{
    expiry_seconds, RequestEnvelope, RequestFault, RequestHeaders, ResponseHeaders,
    HEADER_CONTENT_TYPE, MAX_WIRE_TIMEOUT, SUPPORTED_MAJOR_VERSIONS,
};
use crate::hlc::{HlcClock, HybridLogicalClock};
use crate::payload::{DeserializeError, PayloadSerialize, SerializedPayload};
use crate::topic::{
    self, TokenMap, TopicPattern, TOKEN_COMMAND_NAME, TOKEN_EXECUTOR_ID,
};
use crate::transport::{
    InboundPublish, MqttTransport, MqttVersion, OutboundPublish, PublishProperties, QoS,
    SessionEvent,
};

pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// What a handler failure means to the caller on the other side.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler refused the request content. Wire status 422.
    #[error("invocation rejected: {0}")]
    Invocation(String),
    /// The handler started work and failed. Wire status 500.
    #[error("execution failed: {0}")]
    Execution(String),
}

/// A validated, deserialized request as the user handler sees it.
#[derive(Debug)]
pub struct CommandRequest<TReq> {
    pub payload: TReq,
    pub correlation_id: Uuid,
    /// Client id of the invoker that sent the request.
    pub invoker_id: String,
    pub timestamp: HybridLogicalClock,
    pub fencing_token: Option<HybridLogicalClock>,
    /// The concrete topic the request arrived on.
    pub topic: String,
    /// Fires when the execution window closes. Handlers are expected to
    /// observe it; they are not forcibly terminated.
    pub cancellation: CancellationToken,
}

#[derive(Debug)]
pub struct CommandResponse<TResp> {
    pub payload: TResp,
}

impl<TResp> CommandResponse<TResp> {
    pub fn new(payload: TResp) -> Self {
        Self { payload }
    }
}

/// User handler for one command. Implemented automatically by async
/// closures taking a [`CommandRequest`].
pub trait CommandHandler<TReq, TResp>: Send + Sync + 'static {
    fn handle(
        &self,
        request: CommandRequest<TReq>,
    ) -> BoxFuture<'static, Result<CommandResponse<TResp>, HandlerError>>;
}

impl<F, Fut, TReq, TResp> CommandHandler<TReq, TResp> for F
where
    F: Fn(CommandRequest<TReq>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CommandResponse<TResp>, HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        request: CommandRequest<TReq>,
    ) -> BoxFuture<'static, Result<CommandResponse<TResp>, HandlerError>> {
        Box::pin(self(request))
    }
}

/// Executor configuration. Build with [`ExecutorOptions::new`] plus the
/// `with_*` methods; everything is validated at [`CommandExecutor::new`].
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    command_name: String,
    request_topic_pattern: String,
    is_idempotent: bool,
    cacheable_duration: Duration,
    execution_timeout: Duration,
    topic_namespace: Option<String>,
    max_concurrency: usize,
    discard_expired_on_dispatch: bool,
    shared_subscription_group: Option<String>,
    topic_tokens: TokenMap,
}

impl ExecutorOptions {
    pub fn new(command_name: impl Into<String>, request_topic_pattern: impl Into<String>) -> Self {
        Self {
            command_name: command_name.into(),
            request_topic_pattern: request_topic_pattern.into(),
            is_idempotent: false,
            cacheable_duration: Duration::ZERO,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            topic_namespace: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            discard_expired_on_dispatch: false,
            shared_subscription_group: None,
            topic_tokens: TokenMap::new(),
        }
    }

    pub fn with_idempotent(mut self, is_idempotent: bool) -> Self {
        self.is_idempotent = is_idempotent;
        self
    }

    /// How long finished responses stay replayable beyond the request's own
    /// expiry window. Requires [`ExecutorOptions::with_idempotent`].
    pub fn with_cacheable_duration(mut self, duration: Duration) -> Self {
        self.cacheable_duration = duration;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_topic_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.topic_namespace = Some(namespace.into());
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Drop requests that arrive already expired instead of running the
    /// handler for a response nobody can receive.
    pub fn with_discard_expired_on_dispatch(mut self, discard: bool) -> Self {
        self.discard_expired_on_dispatch = discard;
        self
    }

    pub fn with_shared_subscription_group(mut self, group: impl Into<String>) -> Self {
        self.shared_subscription_group = Some(group.into());
        self
    }

    pub fn with_topic_token(mut self, token: impl Into<String>, value: impl Into<String>) -> Self {
        self.topic_tokens.insert(token.into(), value.into());
        self
    }
}

struct Shared<TReq, TResp> {
    transport: Arc<dyn MqttTransport>,
    handler: Arc<dyn CommandHandler<TReq, TResp>>,
    clock: HlcClock,
    cache: ResponseCache,
    acks: AckQueue,
    permits: Arc<Semaphore>,
    command_name: String,
    execution_timeout: Duration,
    cacheable_duration: Duration,
    discard_expired_on_dispatch: bool,
}

/// The executor engine. Construct, take the shutdown token, then drive it
/// with [`CommandExecutor::run`].
impl<TReq, TResp> std::fmt::Debug for CommandExecutor<TReq, TResp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("subscribe_filter", &self.subscribe_filter)
            .field("receive_filter", &self.receive_filter)
            .finish()
    }
}

pub struct CommandExecutor<TReq, TResp> {
    shared: Arc<Shared<TReq, TResp>>,
    subscribe_filter: String,
    receive_filter: String,
    shutdown: CancellationToken,
}

impl<TReq, TResp> CommandExecutor<TReq, TResp>
where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize,
{
    pub fn new(
        transport: Arc<dyn MqttTransport>,
        options: ExecutorOptions,
        handler: impl CommandHandler<TReq, TResp>,
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
        if options.execution_timeout.is_zero() || options.execution_timeout > MAX_WIRE_TIMEOUT {
            return Err(ProtocolError::configuration_invalid(
                "executionTimeout",
                format!("{:?}", options.execution_timeout),
                "execution timeout must be positive and fit in u32 seconds",
            ));
        }
        if options.max_concurrency == 0 {
            return Err(ProtocolError::configuration_invalid(
                "maxConcurrency",
                "0",
                "concurrency bound must be positive",
            ));
        }
        if !options.cacheable_duration.is_zero() && !options.is_idempotent {
            return Err(ProtocolError::configuration_invalid(
                "cacheableDuration",
                format!("{:?}", options.cacheable_duration),
                "a cacheable duration requires the command to be idempotent",
            ));
        }
        if let Some(ns) = &options.topic_namespace {
            topic::validate_namespace(ns)?;
        }
        topic::validate_token_map(&options.topic_tokens)?;
        let pattern = TopicPattern::new(&options.request_topic_pattern)?;

        let mut tokens = options.topic_tokens.clone();
        tokens
            .entry(TOKEN_COMMAND_NAME.to_string())
            .or_insert_with(|| options.command_name.clone());
        tokens
            .entry(TOKEN_EXECUTOR_ID.to_string())
            .or_insert_with(|| transport.client_id().to_string());

        let mut filter = pattern.to_filter(&tokens);
        if let Some(ns) = &options.topic_namespace {
            filter = topic::prepend_namespace(&filter, ns);
        }
        let receive_filter = filter.clone();
        let subscribe_filter = match &options.shared_subscription_group {
            Some(group) => topic::share_group(&filter, group)?,
            None => filter,
        };

        let clock = HlcClock::new(transport.client_id());
        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                handler: Arc::new(handler),
                clock,
                cache: ResponseCache::new(),
                acks: AckQueue::new(),
                permits: Arc::new(Semaphore::new(options.max_concurrency)),
                command_name: options.command_name,
                execution_timeout: options.execution_timeout,
                cacheable_duration: options.cacheable_duration,
                discard_expired_on_dispatch: options.discard_expired_on_dispatch,
            }),
            subscribe_filter,
            receive_filter,
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that stops [`CommandExecutor::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn command_name(&self) -> &str {
        &self.shared.command_name
    }

    /// Subscribe and serve requests until shutdown, session loss, or
    /// transport failure.
    pub async fn run(self) -> Result<(), ProtocolError> {
        let command = self.shared.command_name.clone();
        let mut inbound = self.shared.transport.register_filter(&self.receive_filter);
        let mut session = self.shared.transport.session_events();

        let granted = self
            .shared
            .transport
            .subscribe(&self.subscribe_filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| {
                ProtocolError::mqtt("request subscribe failed")
                    .with_nested(Box::new(e))
                    .with_command(command.clone())
            })?;
        if granted < QoS::AtLeastOnce {
            return Err(ProtocolError::mqtt(format!(
                "broker granted QoS {granted:?} for request filter"
            ))
            .with_command(command));
        }

        let mut sweeper = tokio::time::interval(CACHE_SWEEP_INTERVAL);
        sweeper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(%command, filter = %self.subscribe_filter, "command executor listening");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!(%command, "command executor shutting down");
                    let _ = self.shared.transport.unsubscribe(&self.subscribe_filter).await;
                    return Ok(());
                }

                event = session.recv() => {
                    if let Ok(SessionEvent::SessionLost) = event {
                        warn!(%command, "broker session lost; stopping");
                        return Err(ProtocolError::state_invalid("session lost").with_command(command));
                    }
                }

                received = inbound.recv() => {
                    match received {
                        Some(publish) => {
                            let InboundPublish { topic, payload, properties, ack } = publish;
                            // Ack order is fixed at receipt, before any
                            // processing can reorder things.
                            let seq = self.shared.acks.enqueue(ack);
                            trace!(%command, %topic, seq, "request received");
                            let shared = self.shared.clone();
                            tokio::spawn(async move {
                                process(shared, topic, payload, properties, seq).await;
                            });
                        }
                        None => {
                            return Err(ProtocolError::mqtt("transport message stream ended")
                                .with_command(command));
                        }
                    }
                }

                _ = sweeper.tick() => {
                    self.shared.cache.sweep(Instant::now());
                }
            }
        }
    }
}

fn envelope_of(headers: &RequestHeaders) -> RequestEnvelope {
    RequestEnvelope {
        correlation_id: headers.correlation_id,
        response_topic: headers.response_topic.clone(),
        message_expiry: headers.message_expiry,
    }
}

fn deserialize_fault(error: DeserializeError) -> ProtocolError {
    match error {
        DeserializeError::UnsupportedContentType(ct) => {
            let mut e = ProtocolError::header_invalid(
                HEADER_CONTENT_TYPE,
                ct,
                "content type not supported by this command",
            );
            e.http_status_code = Some(415);
            e
        }
        DeserializeError::Malformed(msg) | DeserializeError::UnexpectedPayload(msg) => {
            ProtocolError::payload_invalid(msg)
        }
    }
}

async fn process<TReq, TResp>(
    shared: Arc<Shared<TReq, TResp>>,
    topic: String,
    payload: Bytes,
    properties: PublishProperties,
    seq: u64,
) where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize,
{
    let command = shared.command_name.clone();
    let received_at = Instant::now();

    let headers = match RequestHeaders::parse(&properties) {
        Ok(headers) => headers,
        Err(RequestFault::Silent(reason)) => {
            debug!(%command, %reason, "dropping request without responding");
            shared.acks.mark_ready(seq);
            return;
        }
        Err(RequestFault::Respond { envelope, error }) => {
            respond_with_error(&shared, envelope, error, received_at, seq).await;
            return;
        }
    };
    let correlation_id = headers.correlation_id;
    let expires_at = received_at + headers.message_expiry;

    if shared.discard_expired_on_dispatch && headers.message_expiry.is_zero() {
        debug!(%command, %correlation_id, "request expired on arrival; discarding");
        shared.acks.mark_ready(seq);
        return;
    }

    if !headers.protocol_version.is_supported() {
        let error = ProtocolError::unsupported_request_version(
            headers.protocol_version.to_string(),
            SUPPORTED_MAJOR_VERSIONS.to_vec(),
        )
        .with_command(command);
        respond_with_error(&shared, envelope_of(&headers), error, received_at, seq).await;
        return;
    }

    if let Err(error) = shared.clock.observe(&headers.timestamp) {
        respond_with_error(&shared, envelope_of(&headers), error, received_at, seq).await;
        return;
    }

    let guard = match shared.cache.try_reserve(correlation_id, Instant::now()) {
        Reservation::Reserved(guard) => guard,
        Reservation::Hit(entry) => {
            debug!(%command, %correlation_id, "duplicate request; replaying cached response");
            publish_response(&shared, &entry, expires_at, seq).await;
            return;
        }
        Reservation::InFlight(receiver) => {
            trace!(%command, %correlation_id, "duplicate request coalescing onto in-flight execution");
            match receiver.await {
                Ok(entry) => publish_response(&shared, &entry, expires_at, seq).await,
                // Builder went silent; the duplicate does too.
                Err(_) => {
                    shared.acks.mark_ready(seq);
                }
            }
            return;
        }
    };

    let request_payload = match TReq::deserialize(
        &payload,
        headers.content_type.as_deref(),
        headers.format_indicator,
    ) {
        Ok(payload) => payload,
        Err(error) => {
            let error = deserialize_fault(error)
                .with_command(command)
                .with_correlation(correlation_id);
            finish(&shared, guard, &headers, Err(error), expires_at, seq).await;
            return;
        }
    };

    let permit = match shared.permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            // Semaphore closed only happens at teardown.
            drop(guard);
            shared.acks.mark_ready(seq);
            return;
        }
    };

    let expiry_remaining = expires_at.saturating_duration_since(Instant::now());
    let (cancellation_timeout, timeout_name) = if shared.execution_timeout <= expiry_remaining {
        (shared.execution_timeout, "executionTimeout")
    } else {
        (expiry_remaining, "messageExpiry")
    };

    let cancel = CancellationToken::new();
    let request = CommandRequest {
        payload: request_payload,
        correlation_id,
        invoker_id: headers.invoker_client_id.clone(),
        timestamp: headers.timestamp.clone(),
        fencing_token: headers.fencing_token.clone(),
        topic,
        cancellation: cancel.child_token(),
    };

    let mut join = tokio::spawn(shared.handler.handle(request));
    let outcome = tokio::select! {
        joined = &mut join => match joined {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(HandlerError::Invocation(msg))) => Err(ProtocolError::invocation(msg)
                .with_command(command.clone())
                .with_correlation(correlation_id)),
            Ok(Err(HandlerError::Execution(msg))) => Err(ProtocolError::execution(msg)
                .with_command(command.clone())
                .with_correlation(correlation_id)),
            Err(join_error) => {
                Err(ProtocolError::execution(format!("command handler died: {join_error}"))
                    .with_command(command.clone())
                    .with_correlation(correlation_id))
            }
        },
        _ = tokio::time::sleep(cancellation_timeout) => {
            // Cut the handler short: reclaim the permit, answer 408, and
            // let the detached task's eventual return value evaporate.
            cancel.cancel();
            debug!(%command, %correlation_id, ?cancellation_timeout, "handler cut short");
            Err(ProtocolError::timeout(timeout_name, cancellation_timeout)
                .with_command(command.clone())
                .with_correlation(correlation_id))
        }
    };
    drop(permit);

    let wire_outcome = match outcome {
        Ok(response) => match response.payload.serialize() {
            Ok(serialized) => Ok(serialized),
            Err(error) => Err(ProtocolError::internal_logic(format!(
                "response serialization failed: {error}"
            ))
            .with_command(command.clone())
            .with_correlation(correlation_id)),
        },
        Err(error) => Err(error),
    };

    finish(&shared, guard, &headers, wire_outcome, expires_at, seq).await;
}

/// Stamp, cache, and publish the outcome of a reserved execution. Error
/// outcomes are cached exactly like successes so duplicates replay the same
/// answer instead of re-executing.
async fn finish<TReq, TResp>(
    shared: &Arc<Shared<TReq, TResp>>,
    guard: ReservationGuard,
    headers: &RequestHeaders,
    outcome: Result<SerializedPayload, ProtocolError>,
    expires_at: Instant,
    seq: u64,
) where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize,
{
    let stamp = match shared.clock.stamp() {
        Ok(stamp) => stamp,
        Err(error) => {
            warn!(command = %shared.command_name, %error, "cannot stamp response");
            drop(guard);
            shared.acks.mark_ready(seq);
            return;
        }
    };

    let (response_headers, payload) = match outcome {
        Ok(serialized) => {
            let mut h = ResponseHeaders::ok(guard.correlation_id(), stamp);
            if !serialized.content_type.is_empty() {
                h.content_type = Some(serialized.content_type);
            }
            h.format_indicator = serialized.format_indicator;
            (h, Bytes::from(serialized.payload))
        }
        Err(error) => {
            warn!(command = %shared.command_name, correlation_id = %guard.correlation_id(), %error, "responding with error");
            (
                ResponseHeaders::for_error(guard.correlation_id(), stamp, &error),
                Bytes::new(),
            )
        }
    };

    let entry = Arc::new(CachedResponse {
        payload,
        headers: response_headers,
        topic: headers.response_topic.clone(),
    });
    let retention = if shared.cacheable_duration.is_zero() {
        // Non-idempotent: retain exactly for the request's expiry window.
        expires_at
    } else {
        Instant::now() + shared.cacheable_duration
    };
    guard.publish(entry.clone(), retention);

    publish_response(shared, &entry, expires_at, seq).await;
}

/// Respond to a validation fault without touching the cache.
async fn respond_with_error<TReq, TResp>(
    shared: &Arc<Shared<TReq, TResp>>,
    envelope: RequestEnvelope,
    error: ProtocolError,
    received_at: Instant,
    seq: u64,
) where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize,
{
    warn!(
        command = %shared.command_name,
        correlation_id = %envelope.correlation_id,
        %error,
        "request rejected"
    );
    let stamp = match shared.clock.stamp() {
        Ok(stamp) => stamp,
        Err(stamp_error) => {
            warn!(command = %shared.command_name, %stamp_error, "cannot stamp error response");
            shared.acks.mark_ready(seq);
            return;
        }
    };
    let expires_at = received_at + envelope.message_expiry;
    let entry = CachedResponse {
        payload: Bytes::new(),
        headers: ResponseHeaders::for_error(envelope.correlation_id, stamp, &error),
        topic: envelope.response_topic,
    };
    publish_response(shared, &entry, expires_at, seq).await;
}

/// Publish a (possibly cached) response with the expiry that remains of the
/// triggering request's window, then mark the request ack releasable once
/// the broker has acknowledged the response.
async fn publish_response<TReq, TResp>(
    shared: &Arc<Shared<TReq, TResp>>,
    entry: &CachedResponse,
    request_expires_at: Instant,
    seq: u64,
) where
    TReq: PayloadSerialize,
    TResp: PayloadSerialize,
{
    let remaining = request_expires_at.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        debug!(
            command = %shared.command_name,
            topic = %entry.topic,
            "request expiry elapsed before response publish; dropping"
        );
        shared.acks.mark_ready(seq);
        return;
    }

    let publish = OutboundPublish {
        topic: entry.topic.clone(),
        qos: QoS::AtLeastOnce,
        payload: entry.payload.clone(),
        // A live sub-second window rounds up to the wire's 1s granularity
        // rather than vanishing to an expiry of zero.
        properties: entry.headers.to_properties(Some(expiry_seconds(remaining))),
    };

    match shared.transport.publish(publish).await {
        Ok(completion) => match completion.wait().await {
            Ok(()) => {
                shared.acks.mark_ready(seq);
            }
            Err(error) => {
                // No response ack means the request stays unacked; the
                // broker will redeliver it into the cache after reconnect.
                warn!(command = %shared.command_name, %error, "response publish unacknowledged");
            }
        },
        Err(error) => {
            warn!(command = %shared.command_name, %error, "response publish failed");
        }
    }
}
