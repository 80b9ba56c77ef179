// src/handlers.rs - Reset command, desired-patch and passthrough handlers
//
// These run on the dispatcher task, concurrently with the emit loop. They
// reach the loop only through the ResetLatch and the ConfigStore.

use crate::{
    error::Result,
    reset::ResetLatch,
    runtime::{ConfigStore, RuntimeConfig},
    transport::{DeviceClient, DeviceEvent, Message, MethodRequest, MethodResponse},
    twin::{self, Reconciliation, TwinPatch},
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the direct method that resets the simulation
pub const RESET_METHOD: &str = "reset";

const STATUS_OK: u16 = 200;
const STATUS_NOT_IMPLEMENTED: u16 = 501;

/// Request a simulation reset on the next tick
pub fn handle_reset(latch: &ResetLatch) -> MethodResponse {
    latch.request();
    info!("Reset requested");
    MethodResponse::new(STATUS_OK)
}

/// Reconcile a desired patch and report the resulting acknowledgments.
///
/// The store is updated before reporting, so a failed report does not undo
/// the applied values.
pub async fn handle_desired_patch<C: DeviceClient + ?Sized>(
    store: &ConfigStore,
    client: &C,
    patch: &TwinPatch,
) -> Result<Reconciliation> {
    debug!(version = patch.version, keys = patch.properties.len(), "Desired property change");
    let result = store.apply_patch(patch);

    if !result.acks.is_empty() {
        client.update_reported_properties(result.acks.to_reported()).await?;
    }
    Ok(result)
}

/// Derive the startup config from the device twin and report how it was derived
pub async fn bootstrap_from_twin<C: DeviceClient + ?Sized>(
    store: &ConfigStore,
    client: &C,
) -> Result<RuntimeConfig> {
    let document = client.get_twin().await?;
    let (config, acks) = twin::bootstrap_runtime_config(&document, store.snapshot());
    store.replace(config);

    info!(
        send_data = config.send_enabled,
        send_interval_secs = config.send_interval_secs(),
        "Initial values derived from twin"
    );
    client.update_reported_properties(acks.to_reported()).await?;
    Ok(config)
}

/// Copies messages from an input to an output unchanged
#[derive(Debug)]
pub struct PassthroughRelay {
    output: String,
    received: AtomicU64,
}

impl PassthroughRelay {
    /// Relay forwarding to `output`
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            received: AtomicU64::new(0),
        }
    }

    /// Messages seen so far, forwarded or not
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Forward `message`; returns `false` when it had no body and was dropped
    pub async fn relay<C: DeviceClient + ?Sized>(&self, client: &C, message: Message) -> Result<bool> {
        let count = self.received.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            count,
            body = %String::from_utf8_lossy(&message.body),
            "Received message"
        );

        if message.body.is_empty() {
            return Ok(false);
        }
        client.send_event(&self.output, message).await?;
        debug!(output = %self.output, "Received message sent");
        Ok(true)
    }
}

/// Everything the dispatcher needs to route inbound events
#[derive(Debug)]
pub struct HandlerContext {
    /// Live settings patched by desired-property updates
    pub store: ConfigStore,
    /// Latch set by the `reset` method
    pub reset: ResetLatch,
    /// Forwarder for passthrough input messages
    pub relay: PassthroughRelay,
    /// Input whose messages go to `relay`; other inputs are ignored
    pub passthrough_input: String,
}

/// Answer a method call
pub async fn handle_method<C: DeviceClient + ?Sized>(ctx: &HandlerContext, client: &C, request: MethodRequest) {
    let response = match request.name.as_str() {
        RESET_METHOD => handle_reset(&ctx.reset),
        other => {
            warn!(method = other, "Unknown method invoked");
            MethodResponse::new(STATUS_NOT_IMPLEMENTED)
                .with_payload(&json!({ "error": format!("method '{}' is not implemented", other) }))
        }
    };

    if let Err(e) = client.respond_to_method(&request.request_id, response).await {
        warn!(method = %request.name, "Failed to respond to method: {}", e);
    }
}

/// Route one inbound event. Failures are logged; none stop the dispatcher.
pub async fn handle_event<C: DeviceClient + ?Sized>(ctx: &HandlerContext, client: &C, event: DeviceEvent) {
    match event {
        DeviceEvent::DesiredPatch(patch) => {
            if let Err(e) = handle_desired_patch(&ctx.store, client, &patch).await {
                warn!(version = patch.version, "Failed to report acknowledgments: {}", e);
            }
        }
        DeviceEvent::Method(request) => handle_method(ctx, client, request).await,
        DeviceEvent::Input { input, message } if input == ctx.passthrough_input => {
            if let Err(e) = ctx.relay.relay(client, message).await {
                warn!(input = %input, "Failed to relay message: {}", e);
            }
        }
        DeviceEvent::Input { input, .. } => {
            debug!(input = %input, "Ignoring message on unhandled input");
        }
    }
}

/// Consume inbound events until cancelled or the sender side closes
pub async fn dispatch<C: DeviceClient + ?Sized>(
    ctx: &HandlerContext,
    client: &C,
    mut events: mpsc::Receiver<DeviceEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => handle_event(ctx, client, event).await,
                None => break,
            },
        }
    }
    debug!("Event dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryDeviceClient;
    use crate::twin::TwinDocument;

    fn context() -> HandlerContext {
        HandlerContext {
            store: ConfigStore::new(RuntimeConfig::default()),
            reset: ResetLatch::new(),
            relay: PassthroughRelay::new("output1"),
            passthrough_input: "input1".into(),
        }
    }

    #[test]
    fn reset_sets_latch_and_returns_ok() {
        let latch = ResetLatch::new();
        assert_eq!(handle_reset(&latch).status, 200);
        assert!(latch.is_pending());
    }

    #[tokio::test]
    async fn desired_patch_reports_acks() {
        let client = InMemoryDeviceClient::new();
        let store = ConfigStore::new(RuntimeConfig::default());
        let patch = TwinPatch::from_json(json!({"SendInterval": 10, "$version": 4})).unwrap();

        handle_desired_patch(&store, &client, &patch).await.unwrap();

        assert_eq!(store.snapshot().send_interval_secs(), 10);
        assert_eq!(
            client.reported(),
            vec![json!({"SendInterval": {"ac": 200, "av": 4, "value": 10}})]
        );
    }

    #[tokio::test]
    async fn rejected_patch_reports_nothing() {
        let client = InMemoryDeviceClient::new();
        let store = ConfigStore::new(RuntimeConfig::default());
        let patch = TwinPatch::from_json(json!({"SendInterval": -5, "$version": 2})).unwrap();

        let result = handle_desired_patch(&store, &client, &patch).await.unwrap();

        assert_eq!(result.rejected().count(), 1);
        assert!(client.reported().is_empty());
        assert_eq!(store.snapshot(), RuntimeConfig::default());
    }

    #[tokio::test]
    async fn bootstrap_reports_both_properties() {
        let client = InMemoryDeviceClient::new();
        client.set_twin(
            TwinDocument::from_json(json!({"reported": {"SendInterval": 7}})).unwrap(),
        );
        let store = ConfigStore::new(RuntimeConfig::default());

        let config = bootstrap_from_twin(&store, &client).await.unwrap();

        assert_eq!(config.send_interval_secs(), 7);
        assert_eq!(store.snapshot(), config);
        let reported = client.reported();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0]["SendInterval"]["ac"], json!(202));
        assert_eq!(reported[0]["SendData"]["ac"], json!(100));
    }

    #[tokio::test]
    async fn unknown_method_gets_not_implemented() {
        let client = InMemoryDeviceClient::new();
        let ctx = context();
        let request = MethodRequest {
            name: "reboot".into(),
            request_id: "5".into(),
            payload: Vec::new(),
        };

        handle_method(&ctx, &client, request).await;

        let responses = client.method_responses();
        assert_eq!(responses[0].0, "5");
        assert_eq!(responses[0].1.status, 501);
        assert!(!ctx.reset.is_pending());
    }

    #[tokio::test]
    async fn relay_copies_properties_and_skips_empty_bodies() {
        let client = InMemoryDeviceClient::new();
        let ctx = context();

        let message = Message::new("payload").with_property("origin", "plc");
        handle_event(&ctx, &client, DeviceEvent::Input { input: "input1".into(), message: message.clone() }).await;
        handle_event(&ctx, &client, DeviceEvent::Input { input: "input1".into(), message: Message::new("") }).await;
        handle_event(&ctx, &client, DeviceEvent::Input { input: "input9".into(), message: message.clone() }).await;

        assert_eq!(client.sent_on("output1"), vec![message]);
        assert_eq!(ctx.relay.received(), 2);
    }
}
