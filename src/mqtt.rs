// src/mqtt.rs - MQTT device client
//
// Topics follow the IoT Hub MQTT layout so that message properties travel in
// the topic as a form-encoded bag:
//
//   devices/{d}/modules/{m}/messages/events/{props}    telemetry and relayed output
//   devices/{d}/modules/{m}/inputs/{input}/{props}     routed input messages
//   $iothub/twin/PATCH/properties/desired/?$version=N  desired patches
//   $iothub/twin/PATCH/properties/reported/?$rid=R     reported updates
//   $iothub/twin/GET/?$rid=R -> $iothub/twin/res/{status}/?$rid=R
//   $iothub/methods/POST/{name}/?$rid=R -> $iothub/methods/res/{status}/?$rid=R

use crate::{
    config::{MqttConfig, MqttQos},
    error::{Result, SimError},
    transport::{DeviceClient, DeviceEvent, Message, MethodRequest, MethodResponse},
    twin::{TwinDocument, TwinPatch},
};
use async_trait::async_trait;
use dashmap::DashMap;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::form_urlencoded;

const DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const METHOD_PREFIX: &str = "$iothub/methods/POST/";
const API_VERSION: &str = "2021-04-12";
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

impl From<MqttQos> for QoS {
    fn from(qos: MqttQos) -> Self {
        match qos {
            MqttQos::AtMostOnce => QoS::AtMostOnce,
            MqttQos::AtLeastOnce => QoS::AtLeastOnce,
            MqttQos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Response to a twin GET, correlated by request id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwinResponse {
    /// `$rid` of the GET being answered
    pub request_id: String,
    /// Status from the topic, 200 on success
    pub status: u16,
    /// Twin document JSON
    pub body: Vec<u8>,
}

/// A classified inbound publish
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Handed to the dispatcher
    Event(DeviceEvent),
    /// Completes a pending [`DeviceClient::get_twin`]
    TwinResponse(TwinResponse),
}

/// Topic names for one device or module identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    base: String,
}

impl TopicLayout {
    /// Layout for the device, or the module when `module_id` is set
    pub fn new(config: &MqttConfig) -> Self {
        let base = if config.module_id.is_empty() {
            format!("devices/{}", config.device_id)
        } else {
            format!("devices/{}/modules/{}", config.device_id, config.module_id)
        };
        Self { base }
    }

    /// Telemetry topic with the message properties and output name encoded
    pub fn event(&self, output: &str, message: &Message) -> String {
        let mut bag = form_urlencoded::Serializer::new(String::new());
        for (key, value) in &message.properties {
            bag.append_pair(key, value);
        }
        bag.append_pair("$.on", output);
        format!("{}/messages/events/{}", self.base, bag.finish())
    }

    /// Reported-properties update topic
    pub fn reported_patch(&self, request_id: &str) -> String {
        format!("$iothub/twin/PATCH/properties/reported/?$rid={}", request_id)
    }

    /// Full twin request topic
    pub fn twin_get(&self, request_id: &str) -> String {
        format!("$iothub/twin/GET/?$rid={}", request_id)
    }

    /// Reply topic for a method call
    pub fn method_response(&self, status: u16, request_id: &str) -> String {
        format!("$iothub/methods/res/{}/?$rid={}", status, request_id)
    }

    /// Filters to subscribe on every (re)connect
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            format!("{}#", DESIRED_PREFIX),
            format!("{}#", TWIN_RESPONSE_PREFIX),
            format!("{}#", METHOD_PREFIX),
            format!("{}/inputs/#", self.base),
        ]
    }

    /// Classify an inbound publish. `Ok(None)` for topics this client does not handle.
    pub fn parse_inbound(&self, topic: &str, payload: &[u8]) -> Result<Option<Inbound>> {
        if topic.starts_with(DESIRED_PREFIX) {
            let version = query_param(topic, "$version").and_then(|v| v.parse().ok());
            let patch = TwinPatch::from_slice(payload, version)?;
            return Ok(Some(Inbound::Event(DeviceEvent::DesiredPatch(patch))));
        }

        if let Some(rest) = topic.strip_prefix(TWIN_RESPONSE_PREFIX) {
            let status = path_segment(rest)
                .parse()
                .map_err(|_| SimError::Transport(format!("bad twin response topic '{}'", topic)))?;
            let request_id = require_rid(topic)?;
            return Ok(Some(Inbound::TwinResponse(TwinResponse {
                request_id,
                status,
                body: payload.to_vec(),
            })));
        }

        if let Some(rest) = topic.strip_prefix(METHOD_PREFIX) {
            let request = MethodRequest {
                name: path_segment(rest).to_string(),
                request_id: require_rid(topic)?,
                payload: payload.to_vec(),
            };
            return Ok(Some(Inbound::Event(DeviceEvent::Method(request))));
        }

        let inputs = format!("{}/inputs/", self.base);
        if let Some(rest) = topic.strip_prefix(inputs.as_str()) {
            let (input, bag) = rest.split_once('/').unwrap_or((rest, ""));
            let mut message = Message::new(payload);
            for (key, value) in form_urlencoded::parse(bag.as_bytes()) {
                if !key.starts_with('$') {
                    message.properties.insert(key.into_owned(), value.into_owned());
                }
            }
            return Ok(Some(Inbound::Event(DeviceEvent::Input {
                input: input.to_string(),
                message,
            })));
        }

        Ok(None)
    }
}

fn path_segment(rest: &str) -> &str {
    rest.split('/').next().unwrap_or_default()
}

fn query_param(topic: &str, key: &str) -> Option<String> {
    let (_, query) = topic.split_once('?')?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn require_rid(topic: &str) -> Result<String> {
    query_param(topic, "$rid")
        .ok_or_else(|| SimError::Transport(format!("missing $rid in '{}'", topic)))
}

fn transport_error(err: rumqttc::ClientError) -> SimError {
    SimError::Transport(err.to_string())
}

type PendingTwinRequests = Arc<DashMap<String, oneshot::Sender<TwinResponse>>>;

/// Device client publishing through a rumqttc [`AsyncClient`]
pub struct MqttDeviceClient {
    client: AsyncClient,
    topics: TopicLayout,
    qos: QoS,
    pending: PendingTwinRequests,
    next_request_id: AtomicU64,
    request_timeout: Duration,
}

/// Drives the rumqttc event loop and routes inbound publishes
pub struct MqttEventPump {
    eventloop: EventLoop,
    client: AsyncClient,
    topics: TopicLayout,
    qos: QoS,
    pending: PendingTwinRequests,
    connect_timeout: Duration,
}

impl MqttDeviceClient {
    /// Build the client and its event pump. Nothing is sent until the pump is polled.
    pub fn new(config: &MqttConfig) -> Result<(Self, MqttEventPump)> {
        let client_id = config.client_id();
        let mut options = MqttOptions::new(&client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_secs));
        options.set_clean_session(true);
        if let Some(model_id) = &config.model_id {
            let username = format!(
                "{}/{}/?api-version={}&model-id={}",
                config.host, client_id, API_VERSION, model_id
            );
            options.set_credentials(username, "");
        }

        let (client, eventloop) = AsyncClient::new(options, 100);
        let topics = TopicLayout::new(config);
        let qos = QoS::from(config.qos);
        let pending: PendingTwinRequests = Arc::new(DashMap::new());

        let pump = MqttEventPump {
            eventloop,
            client: client.clone(),
            topics: topics.clone(),
            qos,
            pending: pending.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        };

        let device = Self {
            client,
            topics,
            qos,
            pending,
            next_request_id: AtomicU64::new(1),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        };

        Ok((device, pump))
    }

    fn request_id(&self) -> String {
        self.next_request_id.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

#[async_trait]
impl DeviceClient for MqttDeviceClient {
    async fn send_event(&self, output: &str, message: Message) -> Result<()> {
        let topic = self.topics.event(output, &message);
        self.client
            .publish(topic, self.qos, false, message.body)
            .await
            .map_err(transport_error)
    }

    async fn update_reported_properties(&self, patch: Value) -> Result<()> {
        let topic = self.topics.reported_patch(&self.request_id());
        let body = serde_json::to_vec(&patch)?;
        self.client
            .publish(topic, self.qos, false, body)
            .await
            .map_err(transport_error)
    }

    async fn get_twin(&self) -> Result<TwinDocument> {
        let request_id = self.request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let topic = self.topics.twin_get(&request_id);
        if let Err(e) = self.client.publish(topic, self.qos, false, Vec::new()).await {
            self.pending.remove(&request_id);
            return Err(transport_error(e));
        }

        let response = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(SimError::Transport("twin request abandoned".into()));
            }
            Err(_) => {
                self.pending.remove(&request_id);
                return Err(SimError::Timeout("twin response".into()));
            }
        };

        if response.status != 200 {
            return Err(SimError::Transport(format!(
                "twin GET returned status {}",
                response.status
            )));
        }
        TwinDocument::from_slice(&response.body)
    }

    async fn respond_to_method(&self, request_id: &str, response: MethodResponse) -> Result<()> {
        let topic = self.topics.method_response(response.status, request_id);
        self.client
            .publish(topic, self.qos, false, response.payload)
            .await
            .map_err(transport_error)
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

impl MqttEventPump {
    /// Poll until the broker accepts the connection
    pub async fn connect(&mut self) -> Result<()> {
        let wait = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(SimError::Transport(e.to_string())),
                }
            }
        };

        tokio::time::timeout(self.connect_timeout, wait)
            .await
            .map_err(|_| SimError::Timeout("broker CONNACK".into()))??;

        info!("Connected to MQTT broker");
        self.subscribe_all();
        Ok(())
    }

    fn subscribe_all(&self) {
        for filter in self.topics.subscriptions() {
            if let Err(e) = self.client.try_subscribe(&filter, self.qos) {
                warn!("Failed to subscribe to {}: {}", filter, e);
            }
        }
    }

    /// Route inbound traffic until cancelled, reconnecting on errors
    pub async fn run(mut self, events: mpsc::Sender<DeviceEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("MQTT event pump stopping");
                    if let Err(e) = self.client.try_disconnect() {
                        debug!("disconnect request failed: {}", e);
                    }
                    break;
                }
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Reconnected to MQTT broker");
                        self.subscribe_all();
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        route(&self.topics, &self.pending, &publish.topic, &publish.payload[..], &events);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {}", e);
                        if !reconnect_backoff(&cancel).await {
                            info!("MQTT event pump stopping");
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Wait before the next reconnect attempt; `false` once cancelled
async fn reconnect_backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(RECONNECT_BACKOFF) => true,
    }
}

// Never awaits: the dispatcher publishes through the request queue that only
// this pump drains, so a full dispatcher channel drops the event instead.
fn route(
    topics: &TopicLayout,
    pending: &PendingTwinRequests,
    topic: &str,
    payload: &[u8],
    events: &mpsc::Sender<DeviceEvent>,
) -> bool {
    match topics.parse_inbound(topic, payload) {
        Ok(Some(Inbound::Event(event))) => match events.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Event dispatcher is busy; dropping publish on {}", topic);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("event dispatcher has stopped; dropping {}", topic);
                false
            }
        },
        Ok(Some(Inbound::TwinResponse(response))) => match pending.remove(&response.request_id) {
            Some((_, waiter)) => waiter.send(response).is_ok(),
            None => {
                debug!(
                    rid = %response.request_id,
                    status = response.status,
                    "twin response without a waiting request"
                );
                false
            }
        },
        Ok(None) => {
            debug!("ignoring publish on {}", topic);
            false
        }
        Err(e) => {
            warn!("Discarding publish on {}: {}", topic, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn layout() -> TopicLayout {
        TopicLayout::new(&MqttConfig {
            device_id: "dev1".into(),
            module_id: "sim".into(),
            ..MqttConfig::default()
        })
    }

    #[test]
    fn event_topic_carries_property_bag() {
        let message = Message::new("{}")
            .with_property("sequenceNumber", 4)
            .with_property("batchId", "abc");

        assert_eq!(
            layout().event("temperatureOutput", &message),
            "devices/dev1/modules/sim/messages/events/batchId=abc&sequenceNumber=4&%24.on=temperatureOutput"
        );
    }

    #[test]
    fn device_identity_has_no_module_segment() {
        let topics = TopicLayout::new(&MqttConfig {
            device_id: "dev1".into(),
            module_id: String::new(),
            ..MqttConfig::default()
        });
        assert!(topics.subscriptions().contains(&"devices/dev1/inputs/#".to_string()));
    }

    #[test]
    fn desired_patch_takes_version_from_topic() {
        let inbound = layout()
            .parse_inbound(
                "$iothub/twin/PATCH/properties/desired/?$version=5",
                br#"{"SendInterval": 4}"#,
            )
            .unwrap();

        match inbound {
            Some(Inbound::Event(DeviceEvent::DesiredPatch(patch))) => {
                assert_eq!(patch.version, 5);
                assert_eq!(patch.property("SendInterval"), Some(&json!(4)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn method_and_twin_response_topics() {
        let topics = layout();

        let method = topics
            .parse_inbound("$iothub/methods/POST/reset/?$rid=9", b"null")
            .unwrap();
        assert_eq!(
            method,
            Some(Inbound::Event(DeviceEvent::Method(MethodRequest {
                name: "reset".into(),
                request_id: "9".into(),
                payload: b"null".to_vec(),
            })))
        );

        let response = topics
            .parse_inbound("$iothub/twin/res/200/?$rid=3", b"{}")
            .unwrap();
        assert_eq!(
            response,
            Some(Inbound::TwinResponse(TwinResponse {
                request_id: "3".into(),
                status: 200,
                body: b"{}".to_vec(),
            }))
        );

        assert!(topics.parse_inbound("$iothub/methods/POST/reset/", b"").is_err());
    }

    #[test]
    fn input_topic_keeps_application_properties() {
        let inbound = layout()
            .parse_inbound("devices/dev1/modules/sim/inputs/input1/temp=hot&%24.cid=x", b"body")
            .unwrap();

        match inbound {
            Some(Inbound::Event(DeviceEvent::Input { input, message })) => {
                assert_eq!(input, "input1");
                assert_eq!(message.body, b"body".to_vec());
                assert_eq!(message.property("temp"), Some("hot"));
                assert_eq!(message.properties.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unrelated_topics_are_ignored() {
        assert_eq!(layout().parse_inbound("plant/line1/temp", b"1").unwrap(), None);
    }

    #[test]
    fn outbound_topics() {
        let topics = layout();
        assert_eq!(topics.twin_get("7"), "$iothub/twin/GET/?$rid=7");
        assert_eq!(topics.method_response(200, "7"), "$iothub/methods/res/200/?$rid=7");
        assert_eq!(
            topics.reported_patch("8"),
            "$iothub/twin/PATCH/properties/reported/?$rid=8"
        );
    }

    #[test]
    fn full_dispatcher_channel_does_not_stall_routing() {
        let topics = layout();
        let pending: PendingTwinRequests = Arc::new(DashMap::new());
        let (tx, mut rx) = mpsc::channel(1);
        let input = "devices/dev1/modules/sim/inputs/input1/";

        assert!(route(&topics, &pending, input, b"first", &tx));
        assert!(!route(&topics, &pending, input, b"second", &tx));

        // twin responses bypass the dispatcher channel
        let (waiter, mut answer) = oneshot::channel();
        pending.insert("4".into(), waiter);
        assert!(route(&topics, &pending, "$iothub/twin/res/200/?$rid=4", b"{}", &tx));
        assert_eq!(answer.try_recv().unwrap().status, 200);
        assert!(pending.is_empty());

        match rx.try_recv() {
            Ok(DeviceEvent::Input { message, .. }) => assert_eq!(message.body, b"first".to_vec()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert!(route(&topics, &pending, input, b"third", &tx));
    }

    #[test]
    fn closed_dispatcher_drops_events() {
        let pending: PendingTwinRequests = Arc::new(DashMap::new());
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        assert!(!route(&layout(), &pending, "$iothub/methods/POST/reset/?$rid=1", b"", &tx));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_backoff_waits_unless_cancelled() {
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        assert!(reconnect_backoff(&cancel).await);
        assert_eq!(started.elapsed(), RECONNECT_BACKOFF);

        cancel.cancel();
        let started = tokio::time::Instant::now();
        assert!(!reconnect_backoff(&cancel).await);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
