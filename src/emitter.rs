// src/emitter.rs - Periodic emit loop driving the generator and publishing readings

use crate::{
    config::SimulationBounds,
    generator::{RandomWalkGenerator, SimulationState},
    reading::Reading,
    reset::ResetLatch,
    runtime::ConfigStore,
    transport::{DeviceClient, Message, PROP_BATCH_ID, PROP_SEQUENCE_NUMBER},
};
use parking_lot::RwLock;
use rand::{rngs::StdRng, Rng};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of an [`EmitLoop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Constructed, not yet running
    Idle,
    /// Inside `run`
    Ticking,
    /// Cancelled or the message limit was reached
    Stopped,
}

/// Counters kept by an [`EmitLoop`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmitStats {
    /// Current lifecycle state
    pub state: LoopState,
    /// Sequence number the next published message will carry
    pub sequence: u64,
    /// Messages accepted by the transport
    pub sent: u64,
    /// Publish attempts the transport rejected
    pub publish_errors: u64,
    /// Reset requests consumed
    pub resets_applied: u64,
    /// Ticks run, including ones with sending disabled
    pub ticks: u64,
}

impl Default for EmitStats {
    fn default() -> Self {
        Self {
            state: LoopState::Idle,
            sequence: 1,
            sent: 0,
            publish_errors: 0,
            resets_applied: 0,
            ticks: 0,
        }
    }
}

/// Read-only view of a running loop's stats
#[derive(Debug, Clone, Default)]
pub struct StatsHandle {
    inner: Arc<RwLock<EmitStats>>,
}

impl StatsHandle {
    /// Copy of the current counters
    pub fn snapshot(&self) -> EmitStats {
        self.inner.read().clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> LoopState {
        self.inner.read().state
    }
}

/// Identifier attached to every message of one process run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BatchId(Uuid);

impl BatchId {
    /// Fresh random (v4) id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for BatchId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What the publish step of a tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted by the transport
    Sent {
        /// Sequence number the message carried
        sequence: u64,
    },
    /// `SendData` was off; nothing was published
    Disabled,
    /// The transport returned an error; the sequence was not advanced
    Failed,
}

/// Result of one tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    /// Reading generated this tick
    pub reading: Reading,
    /// Whether a pending reset was consumed first
    pub reset_applied: bool,
    /// What happened to the reading
    pub outcome: PublishOutcome,
    /// Wait before the next tick, from the config snapshot of this tick
    pub interval: Duration,
}

/// Sole owner of the [`SimulationState`].
///
/// Other tasks influence the loop only through the [`ConfigStore`] and the
/// [`ResetLatch`]; both are read once at the top of every tick.
pub struct EmitLoop<R = StdRng> {
    bounds: SimulationBounds,
    generator: RandomWalkGenerator<R>,
    state: SimulationState,
    store: ConfigStore,
    reset: ResetLatch,
    batch_id: BatchId,
    output: String,
    max_messages: Option<u64>,
    stats: StatsHandle,
}

impl<R: Rng + Send> EmitLoop<R> {
    /// Build an idle loop; the simulation starts at `bounds.machine_temp_min`
    pub fn new(
        bounds: SimulationBounds,
        generator: RandomWalkGenerator<R>,
        store: ConfigStore,
        reset: ResetLatch,
        batch_id: BatchId,
        output: impl Into<String>,
    ) -> Self {
        let state = SimulationState::new(&bounds);
        Self {
            bounds,
            generator,
            state,
            store,
            reset,
            batch_id,
            output: output.into(),
            max_messages: None,
            stats: StatsHandle::default(),
        }
    }

    /// Stop after this many successful publishes (`None` = unlimited)
    pub fn with_max_messages(mut self, max_messages: Option<u64>) -> Self {
        self.max_messages = max_messages;
        self
    }

    /// Handle that stays readable while the loop runs on another task
    pub fn stats_handle(&self) -> StatsHandle {
        self.stats.clone()
    }

    /// Current simulation state
    pub fn simulation(&self) -> &SimulationState {
        &self.state
    }

    /// Batch id stamped on every message
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Run one iteration: reset check, reading, optional publish.
    ///
    /// Does not sleep; the caller waits `report.interval` before the next tick.
    pub async fn tick<C: DeviceClient + ?Sized>(&mut self, client: &C) -> TickReport {
        let reset_applied = self.reset.consume_if_set();
        if reset_applied {
            self.state.reset(&self.bounds);
            info!(temperature = self.state.temperature(), "Simulation reset");
        }

        let config = self.store.snapshot();
        let reading = self.generator.next(&self.bounds, &mut self.state);

        let outcome = if config.send_enabled {
            self.publish(client, &reading).await
        } else {
            debug!("sending disabled; reading discarded");
            PublishOutcome::Disabled
        };

        {
            let mut stats = self.stats.inner.write();
            stats.ticks += 1;
            stats.sequence = self.state.sequence();
            if reset_applied {
                stats.resets_applied += 1;
            }
            match outcome {
                PublishOutcome::Sent { .. } => stats.sent += 1,
                PublishOutcome::Failed => stats.publish_errors += 1,
                PublishOutcome::Disabled => {}
            }
        }

        TickReport {
            reading,
            reset_applied,
            outcome,
            interval: config.interval(),
        }
    }

    async fn publish<C: DeviceClient + ?Sized>(&mut self, client: &C, reading: &Reading) -> PublishOutcome {
        let sequence = self.state.sequence();
        let body = match reading.to_json() {
            Ok(body) => body,
            Err(e) => {
                warn!(sequence, "Failed to encode reading: {}", e);
                return PublishOutcome::Failed;
            }
        };

        info!(
            sequence,
            body = %String::from_utf8_lossy(&body),
            "Sending message"
        );

        let message = Message::new(body)
            .with_property(PROP_SEQUENCE_NUMBER, sequence)
            .with_property(PROP_BATCH_ID, self.batch_id);

        match client.send_event(&self.output, message).await {
            Ok(()) => {
                self.state.advance_sequence();
                PublishOutcome::Sent { sequence }
            }
            Err(e) => {
                warn!(sequence, transport = client.name(), "Failed to send message: {}", e);
                PublishOutcome::Failed
            }
        }
    }

    fn limit_reached(&self) -> bool {
        self.max_messages
            .is_some_and(|max| self.state.sequence() > max)
    }

    fn set_state(&self, state: LoopState) {
        self.stats.inner.write().state = state;
    }

    /// Tick until cancelled or the message limit is reached.
    ///
    /// The inter-tick sleep is interrupted by `cancel`; a publish already in
    /// flight is allowed to finish.
    pub async fn run<C: DeviceClient + ?Sized>(mut self, client: &C, cancel: CancellationToken) -> EmitStats {
        self.set_state(LoopState::Ticking);
        info!(
            batch_id = %self.batch_id,
            output = %self.output,
            max_messages = ?self.max_messages,
            "Emit loop started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if self.limit_reached() {
                if let Some(max) = self.max_messages {
                    info!("Done sending {} messages", max);
                }
                break;
            }

            let report = self.tick(client).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(report.interval) => {}
            }
        }

        self.set_state(LoopState::Stopped);
        let stats = self.stats.snapshot();
        info!(
            sent = stats.sent,
            publish_errors = stats.publish_errors,
            ticks = stats.ticks,
            "Emit loop stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use crate::transport::InMemoryDeviceClient;

    fn emit_loop(store: ConfigStore, reset: ResetLatch) -> EmitLoop {
        EmitLoop::new(
            SimulationBounds::default(),
            RandomWalkGenerator::seeded(1),
            store,
            reset,
            BatchId::new(),
            "temperatureOutput",
        )
    }

    #[tokio::test]
    async fn sent_messages_carry_sequence_and_batch() {
        let client = InMemoryDeviceClient::new();
        let mut emitter = emit_loop(ConfigStore::new(RuntimeConfig::default()), ResetLatch::new());
        let batch = emitter.batch_id().to_string();

        for expected in 1..=3u64 {
            let report = emitter.tick(&client).await;
            assert_eq!(report.outcome, PublishOutcome::Sent { sequence: expected });
        }

        let sent = client.sent_on("temperatureOutput");
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].property(PROP_SEQUENCE_NUMBER), Some("3"));
        assert!(sent.iter().all(|m| m.property(PROP_BATCH_ID) == Some(batch.as_str())));
        assert_eq!(emitter.stats_handle().snapshot().sequence, 4);
    }

    #[tokio::test]
    async fn disabled_sending_still_advances_the_walk() {
        let client = InMemoryDeviceClient::new();
        let store = ConfigStore::new(RuntimeConfig::new(false, 3).unwrap());
        let mut emitter = emit_loop(store, ResetLatch::new());

        let start = emitter.simulation().temperature();
        for _ in 0..5 {
            assert_eq!(emitter.tick(&client).await.outcome, PublishOutcome::Disabled);
        }

        assert!(client.sent().is_empty());
        assert_eq!(emitter.simulation().sequence(), 1);
        assert_ne!(emitter.simulation().temperature(), start);
    }

    #[tokio::test]
    async fn reset_is_applied_once_and_keeps_sequence() {
        let client = InMemoryDeviceClient::new();
        let reset = ResetLatch::new();
        let mut emitter = emit_loop(ConfigStore::new(RuntimeConfig::default()), reset.clone());

        for _ in 0..10 {
            emitter.tick(&client).await;
        }
        reset.request();
        reset.request();

        let report = emitter.tick(&client).await;
        assert!(report.reset_applied);
        assert!((19.75..=21.25).contains(&report.reading.machine.temperature));
        assert_eq!(report.outcome, PublishOutcome::Sent { sequence: 11 });

        assert!(!emitter.tick(&client).await.reset_applied);
        assert_eq!(emitter.stats_handle().snapshot().resets_applied, 1);
    }

    #[tokio::test]
    async fn failed_publish_does_not_consume_a_sequence_number() {
        let client = InMemoryDeviceClient::new();
        client.fail_next_sends(1);
        let mut emitter = emit_loop(ConfigStore::new(RuntimeConfig::default()), ResetLatch::new());

        assert_eq!(emitter.tick(&client).await.outcome, PublishOutcome::Failed);
        assert_eq!(emitter.tick(&client).await.outcome, PublishOutcome::Sent { sequence: 1 });

        let stats = emitter.stats_handle().snapshot();
        assert_eq!((stats.sent, stats.publish_errors, stats.ticks), (1, 1, 2));
    }

    #[tokio::test]
    async fn interval_follows_the_store_snapshot() {
        let client = InMemoryDeviceClient::new();
        let store = ConfigStore::new(RuntimeConfig::default());
        let mut emitter = emit_loop(store.clone(), ResetLatch::new());

        assert_eq!(emitter.tick(&client).await.interval, Duration::from_secs(3));
        store.replace(RuntimeConfig::new(true, 9).unwrap());
        assert_eq!(emitter.tick(&client).await.interval, Duration::from_secs(9));
    }
}
