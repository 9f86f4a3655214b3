use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use velbus_gateway::gateway::{Gateway, GatewayRequest, GatewayStats};
use velbus_gateway::messages::builtin_registry;
use velbus_gateway::module::{Reply, ReplyBody, Verb};
use velbus_gateway::patch::apply;
use velbus_gateway::protocol::Frame;

const ADDRESS: u8 = 0x30;

async fn dispatch(
    requests: &mpsc::Sender<GatewayRequest>,
    path: &str,
    verb: Verb,
    body: Value,
) -> Reply {
    let (reply, rx) = oneshot::channel();
    requests
        .send(GatewayRequest::Dispatch {
            address: ADDRESS,
            path: path.to_string(),
            verb,
            body,
            reply,
        })
        .await
        .unwrap();
    timeout(Duration::from_secs(2), rx).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_gateway_serves_frames_requests_and_delayed_calls() {
    let registry = Arc::new(builtin_registry().unwrap());
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (frame_tx, frame_rx) = mpsc::channel(16);
    let (request_tx, request_rx) = mpsc::channel(16);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let gateway = Gateway::new(registry, outbound_tx, 64);
    let task = tokio::spawn(gateway.run(frame_rx, request_rx, async move {
        let _ = stop_rx.await;
    }));

    // VMB6IN status: input 0 closed, led 1 on
    frame_tx
        .send(Frame::new(ADDRESS, 0xed, &[0x01, 0x02, 0, 0]).unwrap())
        .await
        .unwrap();
    // Nothing registered for this one
    frame_tx.send(Frame::new(ADDRESS, 0x42, &[]).unwrap()).await.unwrap();

    let kind = dispatch(&request_tx, "type", Verb::Get, Value::Null).await;
    assert_eq!(kind.status, 200);
    assert_eq!(kind.body, ReplyBody::Text("Mirror at 0x30\r\n".to_string()));

    let missing = dispatch(&request_tx, "nope", Verb::Get, Value::Null).await;
    assert_eq!(missing.status, 404);

    let (reply, rx) = oneshot::channel();
    request_tx.send(GatewayRequest::Subscribe { reply }).await.unwrap();
    let mut subscription = rx.await.unwrap();
    assert_eq!(subscription.snapshot.len(), 1);
    let mut mirrored = json!({});
    for op in &subscription.snapshot[0].ops {
        apply(&mut mirrored, op).unwrap();
    }
    assert_eq!(
        mirrored.pointer("/messages/ModuleStatus6IN/input_status/0"),
        Some(&Value::Bool(true))
    );

    let state = dispatch(&request_tx, "state/messages/ModuleStatus6IN/leds_on/1", Verb::Get, Value::Null).await;
    assert_eq!(state.body, ReplyBody::Json(Value::Bool(true)));

    let scheduled = dispatch(&request_tx, "refresh", Verb::Post, json!({"delay": 0})).await;
    assert_eq!(scheduled.status, 202);

    let sent = timeout(Duration::from_secs(2), outbound_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sent.address, ADDRESS);
    assert_eq!(sent.command, 0xe7);

    // The refresh bookkeeping reaches live subscribers
    let patch = timeout(Duration::from_secs(2), subscription.patches.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(patch.address, ADDRESS);
    for op in &patch.ops {
        apply(&mut mirrored, op).unwrap();
    }
    assert!(mirrored.get("last_refresh").is_some());

    stop_tx.send(()).unwrap();
    let stats: GatewayStats = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert_eq!(stats.frames_received, 2);
    assert_eq!(stats.frames_decoded, 1);
    assert_eq!(stats.unknown_frames, 1);
    assert_eq!(stats.modules_created, 1);
    assert!(stats.timer_wakeups >= 1);
    assert_eq!(stats.delayed_calls_fired, 1);
    assert_eq!(stats.modules_faulted, 0);
}

#[tokio::test]
async fn test_gateway_stops_when_frame_source_closes() {
    let registry = Arc::new(builtin_registry().unwrap());
    let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
    let (frame_tx, frame_rx) = mpsc::channel(4);
    let (_request_tx, request_rx) = mpsc::channel(4);

    let gateway = Gateway::new(registry, outbound_tx, 8);
    let task = tokio::spawn(gateway.run(frame_rx, request_rx, std::future::pending()));
    drop(frame_tx);

    let stats = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert_eq!(stats, GatewayStats::default());
}
