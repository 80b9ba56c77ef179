// src/transport.rs - Device client interface between the simulator and its broker
//
// The emit loop and the command/twin handlers only talk to a `DeviceClient`.
// Inbound traffic (desired patches, method calls, routed input messages) is
// delivered as `DeviceEvent`s over a channel by whichever transport is in use.

use crate::{
    error::{Result, SimError},
    twin::{TwinDocument, TwinPatch},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Application property carrying the per-message sequence number
pub const PROP_SEQUENCE_NUMBER: &str = "sequenceNumber";
/// Application property carrying the process batch id
pub const PROP_BATCH_ID: &str = "batchId";

/// Outbound or routed message: opaque body plus string properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Payload bytes, usually UTF-8 JSON
    pub body: Vec<u8>,
    /// Application properties, ordered for stable topic encoding
    pub properties: BTreeMap<String, String>,
}

impl Message {
    /// Message without properties
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Add or overwrite a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.properties.insert(key.into(), value.to_string());
        self
    }

    /// Property value by name
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Direct method invocation from the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    /// Method name, e.g. `reset`
    pub name: String,
    /// Correlation id echoed in the response
    pub request_id: String,
    /// Raw JSON arguments
    pub payload: Vec<u8>,
}

/// Result returned for a [`MethodRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodResponse {
    /// HTTP-style status
    pub status: u16,
    /// JSON body, `{}` unless set
    pub payload: Vec<u8>,
}

impl MethodResponse {
    /// Response with an empty JSON object body
    pub fn new(status: u16) -> Self {
        Self {
            status,
            payload: b"{}".to_vec(),
        }
    }

    /// Replace the body with `payload`
    pub fn with_payload(mut self, payload: &Value) -> Self {
        self.payload = payload.to_string().into_bytes();
        self
    }
}

/// Inbound traffic dispatched to the handlers
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Partial update of the desired properties
    DesiredPatch(TwinPatch),
    /// Direct method call awaiting a response
    Method(MethodRequest),
    /// Message routed to one of the module's inputs
    Input {
        /// Input name, e.g. `input1`
        input: String,
        /// The routed message
        message: Message,
    },
}

/// Operations the simulator needs from its device connection.
///
/// Implementations are shared between the emit loop and the dispatcher, so
/// every call takes `&self`.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Publish a message on a named output
    async fn send_event(&self, output: &str, message: Message) -> Result<()>;

    /// Merge a patch into the reported properties
    async fn update_reported_properties(&self, patch: Value) -> Result<()>;

    /// Fetch the full desired/reported twin
    async fn get_twin(&self) -> Result<TwinDocument>;

    /// Answer a method call
    async fn respond_to_method(&self, request_id: &str, response: MethodResponse) -> Result<()>;

    /// Transport name for logs
    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
struct LoopbackState {
    sent: Vec<(String, Message)>,
    reported: Vec<Value>,
    method_responses: Vec<(String, MethodResponse)>,
    twin: TwinDocument,
    failing_sends: u32,
    twin_unavailable: bool,
}

/// In-process client that records everything it is asked to do.
///
/// Used by the test-suite and for running the simulator without a broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeviceClient {
    state: Arc<Mutex<LoopbackState>>,
}

impl InMemoryDeviceClient {
    /// Client with an empty twin and nothing recorded
    pub fn new() -> Self {
        Self::default()
    }

    /// Twin returned by [`get_twin`](DeviceClient::get_twin)
    pub fn set_twin(&self, twin: TwinDocument) {
        self.state.lock().twin = twin;
    }

    /// Make `get_twin` fail until cleared
    pub fn set_twin_unavailable(&self, unavailable: bool) {
        self.state.lock().twin_unavailable = unavailable;
    }

    /// Make the next `count` sends fail with a transport error
    pub fn fail_next_sends(&self, count: u32) {
        self.state.lock().failing_sends = count;
    }

    /// Every message sent, with its output
    pub fn sent(&self) -> Vec<(String, Message)> {
        self.state.lock().sent.clone()
    }

    /// Messages sent on one output
    pub fn sent_on(&self, output: &str) -> Vec<Message> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(name, _)| name == output)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Reported-property patches in arrival order
    pub fn reported(&self) -> Vec<Value> {
        self.state.lock().reported.clone()
    }

    /// Method responses keyed by request id
    pub fn method_responses(&self) -> Vec<(String, MethodResponse)> {
        self.state.lock().method_responses.clone()
    }
}

#[async_trait]
impl DeviceClient for InMemoryDeviceClient {
    async fn send_event(&self, output: &str, message: Message) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(SimError::Transport(format!("send on '{}' refused", output)));
        }
        state.sent.push((output.to_string(), message));
        Ok(())
    }

    async fn update_reported_properties(&self, patch: Value) -> Result<()> {
        self.state.lock().reported.push(patch);
        Ok(())
    }

    async fn get_twin(&self) -> Result<TwinDocument> {
        let state = self.state.lock();
        if state.twin_unavailable {
            return Err(SimError::Timeout("twin response".into()));
        }
        Ok(state.twin.clone())
    }

    async fn respond_to_method(&self, request_id: &str, response: MethodResponse) -> Result<()> {
        self.state
            .lock()
            .method_responses
            .push((request_id.to_string(), response));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}
