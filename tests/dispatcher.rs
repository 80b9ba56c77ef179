use serde_json::json;
use tempsim::{
    handlers::{self, HandlerContext, PassthroughRelay},
    ConfigStore, DeviceEvent, InMemoryDeviceClient, Message, MethodRequest, ResetLatch,
    RuntimeConfig, TwinPatch,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn context() -> HandlerContext {
    HandlerContext {
        store: ConfigStore::new(RuntimeConfig::default()),
        reset: ResetLatch::new(),
        relay: PassthroughRelay::new("output1"),
        passthrough_input: "input1".into(),
    }
}

#[tokio::test]
async fn routes_every_event_kind() {
    let client = InMemoryDeviceClient::new();
    let ctx = context();
    let (tx, rx) = mpsc::channel(8);

    tx.send(DeviceEvent::Method(MethodRequest {
        name: "reset".into(),
        request_id: "1".into(),
        payload: Vec::new(),
    }))
    .await
    .unwrap();
    tx.send(DeviceEvent::DesiredPatch(
        TwinPatch::from_json(json!({"SendInterval": "12", "SendData": "false", "$version": 6})).unwrap(),
    ))
    .await
    .unwrap();
    tx.send(DeviceEvent::Input {
        input: "input1".into(),
        message: Message::new("raw").with_property("line", "4"),
    })
    .await
    .unwrap();
    drop(tx);

    handlers::dispatch(&ctx, &client, rx, CancellationToken::new()).await;

    assert!(ctx.reset.is_pending());
    assert_eq!(client.method_responses()[0].1.status, 200);

    let config = ctx.store.snapshot();
    assert_eq!(config.send_interval_secs(), 12);
    assert!(!config.send_enabled);
    assert_eq!(
        client.reported(),
        vec![json!({
            "SendData": {"ac": 200, "av": 6, "value": false},
            "SendInterval": {"ac": 200, "av": 6, "value": 12}
        })]
    );

    let relayed = client.sent_on("output1");
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].body, b"raw".to_vec());
    assert_eq!(relayed[0].property("line"), Some("4"));
}

#[tokio::test]
async fn relay_failure_does_not_stop_dispatch() {
    let client = InMemoryDeviceClient::new();
    client.fail_next_sends(1);
    let ctx = context();
    let (tx, rx) = mpsc::channel(8);

    for body in ["first", "second"] {
        tx.send(DeviceEvent::Input {
            input: "input1".into(),
            message: Message::new(body),
        })
        .await
        .unwrap();
    }
    drop(tx);

    handlers::dispatch(&ctx, &client, rx, CancellationToken::new()).await;

    assert_eq!(ctx.relay.received(), 2);
    assert_eq!(client.sent_on("output1"), vec![Message::new("second")]);
}

#[tokio::test]
async fn cancelled_dispatcher_returns_with_sender_open() {
    let client = InMemoryDeviceClient::new();
    let ctx = context();
    let (_tx, rx) = mpsc::channel::<DeviceEvent>(1);
    let cancel = CancellationToken::new();
    cancel.cancel();

    handlers::dispatch(&ctx, &client, rx, cancel).await;
    assert!(client.sent().is_empty());
}
