//! Executor pipeline semantics driven with hand-built request packets:
//! deduplication, ack ordering, expiry windows, and version negotiation.

mod fixtures;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fixtures::{MemoryBroker, MemoryTransport};
use palaver::executor::{
    CommandExecutor, CommandRequest, CommandResponse, ExecutorOptions, HandlerError,
};
use palaver::headers::{
    RequestHeaders, PROP_PROTOCOL_VERSION, PROP_REQUEST_PROTOCOL_VERSION, PROP_STATUS,
    PROP_SUPPORTED_MAJOR_VERSIONS, PROTOCOL_VERSION,
};
use palaver::hlc::HybridLogicalClock;
use palaver::payload::{FormatIndicator, Json};
use palaver::transport::{InboundPublish, MqttTransport, OutboundPublish, QoS};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

const REQUEST_TOPIC: &str = "devices/oven-7/commands/bake";
const RESPONSE_TOPIC: &str = "clients/chef-1/answers";

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

fn raw_request(cid: Uuid, payload: &[u8], expiry: Duration) -> OutboundPublish {
    let headers = RequestHeaders {
        correlation_id: cid,
        response_topic: RESPONSE_TOPIC.to_string(),
        message_expiry: expiry,
        content_type: Some("application/json".to_string()),
        format_indicator: FormatIndicator::Utf8EncodedCharacterData,
        timestamp: HybridLogicalClock::new(now_ms(), 0, "chef-1"),
        fencing_token: None,
        invoker_client_id: "chef-1".to_string(),
        protocol_version: PROTOCOL_VERSION,
        partition: "chef-1".to_string(),
    };
    OutboundPublish {
        topic: REQUEST_TOPIC.to_string(),
        qos: QoS::AtLeastOnce,
        payload: bytes::Bytes::copy_from_slice(payload),
        properties: headers.to_properties(),
    }
}

struct Rig {
    broker: Arc<MemoryBroker>,
    exec_transport: Arc<MemoryTransport>,
    responses: UnboundedReceiver<InboundPublish>,
    calls: Arc<AtomicUsize>,
}

/// Executor wired to a counting handler; payload value selects behavior:
/// 1 sleeps 300ms before echoing, anything else echoes immediately.
async fn rig(options: ExecutorOptions) -> Rig {
    let broker = MemoryBroker::new();
    let exec_transport = broker.client("oven-7");
    let watcher = broker.client("chef-1");

    let responses = watcher.register_filter(RESPONSE_TOPIC);
    watcher
        .subscribe(RESPONSE_TOPIC, QoS::AtLeastOnce)
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    let handler = move |request: CommandRequest<Json<u32>>| {
        let calls = handler_calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if request.payload.0 == 1 {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            Ok::<_, HandlerError>(CommandResponse::new(request.payload))
        }
    };

    let executor =
        CommandExecutor::<Json<u32>, Json<u32>>::new(exec_transport.clone(), options, handler)
            .unwrap();
    tokio::spawn(executor.run());
    exec_transport.wait_until_subscribed().await;

    Rig {
        broker,
        exec_transport,
        responses,
        calls,
    }
}

async fn next_response(rx: &mut UnboundedReceiver<InboundPublish>) -> InboundPublish {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for a response")
        .expect("response stream closed")
}

fn status_of(publish: &InboundPublish) -> &str {
    publish.properties.user_property(PROP_STATUS).unwrap()
}

fn correlation_of(publish: &InboundPublish) -> Uuid {
    Uuid::from_slice(publish.properties.correlation_data.as_ref().unwrap()).unwrap()
}

#[tokio::test]
async fn redelivered_request_replays_without_reexecution() {
    let mut rig = rig(ExecutorOptions::new(
        "bake",
        "devices/{executorId}/commands/{commandName}",
    ))
    .await;

    let cid = Uuid::new_v4();
    let request = raw_request(cid, b"42", Duration::from_secs(10));

    rig.broker.route(&request);
    let first = next_response(&mut rig.responses).await;
    assert_eq!(status_of(&first), "200");
    assert_eq!(correlation_of(&first), cid);
    assert_eq!(first.payload.as_ref(), b"42");

    // The broker replays the request (lost PUBACK). Same response goes out
    // again; the handler does not run a second time.
    rig.broker.route(&request);
    let second = next_response(&mut rig.responses).await;
    assert_eq!(status_of(&second), "200");
    assert_eq!(correlation_of(&second), cid);
    assert_eq!(second.payload.as_ref(), b"42");

    assert_eq!(rig.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_duplicates_coalesce_onto_one_execution() {
    let mut rig = rig(ExecutorOptions::new(
        "bake",
        "devices/{executorId}/commands/{commandName}",
    ))
    .await;

    let cid = Uuid::new_v4();
    // Payload 1 sleeps, so the duplicate lands while the first execution
    // is still in flight.
    let request = raw_request(cid, b"1", Duration::from_secs(10));
    rig.broker.route(&request);
    rig.broker.route(&request);

    let first = next_response(&mut rig.responses).await;
    let second = next_response(&mut rig.responses).await;
    assert_eq!(correlation_of(&first), cid);
    assert_eq!(correlation_of(&second), cid);
    assert_eq!(rig.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn request_acks_release_in_receipt_order() {
    let mut rig = rig(ExecutorOptions::new(
        "bake",
        "devices/{executorId}/commands/{commandName}",
    ))
    .await;

    let slow = Uuid::new_v4();
    let fast = Uuid::new_v4();
    rig.broker.route(&raw_request(slow, b"1", Duration::from_secs(10)));
    rig.broker.route(&raw_request(fast, b"2", Duration::from_secs(10)));

    // The fast response overtakes the slow one on the wire.
    let first = next_response(&mut rig.responses).await;
    let second = next_response(&mut rig.responses).await;
    assert_eq!(correlation_of(&first), fast);
    assert_eq!(correlation_of(&second), slow);

    // But the request acks still release in receipt order.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.exec_transport.ack_log(), vec![Some(slow), Some(fast)]);
}

#[tokio::test]
async fn request_without_response_topic_is_acked_silently() {
    let mut rig = rig(ExecutorOptions::new(
        "bake",
        "devices/{executorId}/commands/{commandName}",
    ))
    .await;

    let cid = Uuid::new_v4();
    let mut request = raw_request(cid, b"42", Duration::from_secs(10));
    request.properties.response_topic = None;
    rig.broker.route(&request);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rig.broker.published().is_empty());
    assert_eq!(rig.exec_transport.ack_log(), vec![Some(cid)]);
    assert_eq!(rig.calls.load(Ordering::SeqCst), 0);
    assert!(rig.responses.try_recv().is_err());
}

#[tokio::test]
async fn expired_request_discarded_when_configured() {
    let mut rig = rig(ExecutorOptions::new(
        "bake",
        "devices/{executorId}/commands/{commandName}",
    )
    .with_discard_expired_on_dispatch(true))
    .await;

    let cid = Uuid::new_v4();
    rig.broker.route(&raw_request(cid, b"42", Duration::ZERO));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rig.broker.published().is_empty());
    assert_eq!(rig.exec_transport.ack_log(), vec![Some(cid)]);
    assert_eq!(rig.calls.load(Ordering::SeqCst), 0);
    assert!(rig.responses.try_recv().is_err());
}

#[tokio::test]
async fn protocol_version_mismatch_answers_505() {
    let mut rig = rig(ExecutorOptions::new(
        "bake",
        "devices/{executorId}/commands/{commandName}",
    ))
    .await;

    let cid = Uuid::new_v4();
    let mut request = raw_request(cid, b"42", Duration::from_secs(10));
    request
        .properties
        .user_properties
        .retain(|(k, _)| k != PROP_PROTOCOL_VERSION);
    request
        .properties
        .push_user_property(PROP_PROTOCOL_VERSION, "2.0");
    rig.broker.route(&request);

    let response = next_response(&mut rig.responses).await;
    assert_eq!(status_of(&response), "505");
    assert_eq!(
        response
            .properties
            .user_property(PROP_SUPPORTED_MAJOR_VERSIONS),
        Some("1")
    );
    assert_eq!(
        response
            .properties
            .user_property(PROP_REQUEST_PROTOCOL_VERSION),
        Some("2.0")
    );
    assert_eq!(rig.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cut_short_handler_answers_408_and_late_result_is_discarded() {
    let mut rig = rig(ExecutorOptions::new(
        "bake",
        "devices/{executorId}/commands/{commandName}",
    )
    .with_execution_timeout(Duration::from_millis(100)))
    .await;

    let cid = Uuid::new_v4();
    // Payload 1 sleeps 300ms, past the 100ms execution timeout.
    rig.broker.route(&raw_request(cid, b"1", Duration::from_secs(10)));

    let response = next_response(&mut rig.responses).await;
    assert_eq!(status_of(&response), "408");
    assert_eq!(correlation_of(&response), cid);

    // Let the detached handler run to completion; its result must not
    // produce a second response.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(rig.calls.load(Ordering::SeqCst), 1);
    assert!(rig.responses.try_recv().is_err());
}

#[tokio::test]
async fn idempotent_cache_outlives_the_request_window() {
    let mut rig = rig(ExecutorOptions::new(
        "bake",
        "devices/{executorId}/commands/{commandName}",
    )
    .with_idempotent(true)
    .with_cacheable_duration(Duration::from_secs(60)))
    .await;

    let cid = Uuid::new_v4();
    rig.broker.route(&raw_request(cid, b"42", Duration::from_secs(1)));
    let first = next_response(&mut rig.responses).await;
    assert_eq!(status_of(&first), "200");

    // Past the original request's expiry, a retry with the same
    // correlation id and a fresh window still replays from cache.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    rig.broker.route(&raw_request(cid, b"42", Duration::from_secs(10)));
    let second = next_response(&mut rig.responses).await;
    assert_eq!(status_of(&second), "200");
    assert_eq!(correlation_of(&second), cid);
    assert_eq!(rig.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn non_idempotent_cache_ends_with_the_request_window() {
    let mut rig = rig(ExecutorOptions::new(
        "bake",
        "devices/{executorId}/commands/{commandName}",
    ))
    .await;

    let cid = Uuid::new_v4();
    rig.broker.route(&raw_request(cid, b"42", Duration::from_secs(1)));
    let first = next_response(&mut rig.responses).await;
    assert_eq!(status_of(&first), "200");

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    rig.broker.route(&raw_request(cid, b"42", Duration::from_secs(10)));
    let second = next_response(&mut rig.responses).await;
    assert_eq!(status_of(&second), "200");
    // The cache window closed with the request expiry, so this executed
    // again.
    assert_eq!(rig.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn distinct_correlation_ids_execute_separately() {
    let mut rig = rig(ExecutorOptions::new(
        "bake",
        "devices/{executorId}/commands/{commandName}",
    )
    .with_idempotent(true)
    .with_cacheable_duration(Duration::from_secs(60)))
    .await;

    // Same payload, different correlation ids: dedup keys on correlation
    // id only, so both execute.
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    rig.broker.route(&raw_request(a, b"42", Duration::from_secs(10)));
    rig.broker.route(&raw_request(b, b"42", Duration::from_secs(10)));

    let mut seen = vec![
        correlation_of(&next_response(&mut rig.responses).await),
        correlation_of(&next_response(&mut rig.responses).await),
    ];
    seen.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(seen, expected);
    assert_eq!(rig.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn malformed_payload_answers_400() {
    let mut rig = rig(ExecutorOptions::new(
        "bake",
        "devices/{executorId}/commands/{commandName}",
    ))
    .await;

    let cid = Uuid::new_v4();
    rig.broker
        .route(&raw_request(cid, b"{not json", Duration::from_secs(10)));

    let response = next_response(&mut rig.responses).await;
    assert_eq!(status_of(&response), "400");
    assert_eq!(rig.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unsupported_content_type_answers_415() {
    let mut rig = rig(ExecutorOptions::new(
        "bake",
        "devices/{executorId}/commands/{commandName}",
    ))
    .await;

    let cid = Uuid::new_v4();
    let mut request = raw_request(cid, b"42", Duration::from_secs(10));
    request.properties.content_type = Some("application/cbor".to_string());
    rig.broker.route(&request);

    let response = next_response(&mut rig.responses).await;
    assert_eq!(status_of(&response), "415");
    assert_eq!(rig.calls.load(Ordering::SeqCst), 0);
}
