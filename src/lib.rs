//! tempsim - Simulated temperature sensor
//!
//! Fabricates correlated machine temperature/pressure and ambient
//! temperature/humidity readings and publishes them at a configurable cadence,
//! while staying remotely reconfigurable through desired/reported properties
//! and a `reset` command.
//!
//! # Feature Flags
//!
//! - **mqtt** (default): [`mqtt::MqttDeviceClient`] and the `tempsim` binary
//!
//! # Examples
//!
//! ```rust
//! use tempsim::{
//!     BatchId, ConfigStore, EmitLoop, InMemoryDeviceClient, RandomWalkGenerator,
//!     ResetLatch, RuntimeConfig, SimulationBounds,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let client = InMemoryDeviceClient::new();
//! let mut emitter = EmitLoop::new(
//!     SimulationBounds::default(),
//!     RandomWalkGenerator::seeded(42),
//!     ConfigStore::new(RuntimeConfig::default()),
//!     ResetLatch::new(),
//!     BatchId::new(),
//!     "temperatureOutput",
//! );
//!
//! let report = emitter.tick(&client).await;
//! assert_eq!(client.sent().len(), 1);
//! assert!(report.reading.machine.temperature >= 19.75);
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// CORE MODULES
// ============================================================================

/// Error type shared by the whole crate
pub mod error;

/// YAML configuration with defaults, validation and env overrides
pub mod config;

/// Telemetry payload
pub mod reading;

/// Random walk generator
pub mod generator;

/// Reset request latch
pub mod reset;

/// Live `SendData` / `SendInterval` settings
pub mod runtime;

/// Desired/reported property reconciliation
pub mod twin;

/// Device client interface and in-memory implementation
pub mod transport;

/// Periodic emit loop
pub mod emitter;

/// Reset, desired-patch and passthrough handlers
pub mod handlers;

// ============================================================================
// TRANSPORT MODULES (feature-gated)
// ============================================================================

/// MQTT device client
#[cfg(feature = "mqtt")]
#[cfg_attr(docsrs, doc(cfg(feature = "mqtt")))]
pub mod mqtt;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use config::{Config, MqttConfig, MqttQos, RuntimeSettings, SimulationBounds};
pub use emitter::{BatchId, EmitLoop, EmitStats, LoopState, PublishOutcome, StatsHandle, TickReport};
pub use error::{Result, SimError};
pub use generator::{RandomWalkGenerator, SimulationState};
pub use handlers::{HandlerContext, PassthroughRelay};
pub use reading::Reading;
pub use reset::ResetLatch;
pub use runtime::{ConfigStore, RuntimeConfig};
pub use transport::{DeviceClient, DeviceEvent, InMemoryDeviceClient, Message, MethodRequest, MethodResponse};
pub use twin::{AckEntry, Acks, KeyOutcome, Reconciliation, TwinDocument, TwinPatch};

#[cfg(feature = "mqtt")]
pub use mqtt::{MqttDeviceClient, MqttEventPump};

// ============================================================================
// BUILD INFORMATION
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build timestamp recorded by `build.rs`
pub const BUILD_TIMESTAMP: &str = match option_env!("TEMPSIM_BUILD_TIMESTAMP") {
    Some(timestamp) => timestamp,
    None => "unknown",
};

/// Compiler that built this crate
pub const RUST_VERSION: &str = match option_env!("TEMPSIM_RUST_VERSION") {
    Some(version) => version,
    None => "unknown",
};

/// Default log directive used when `RUST_LOG` does not mention this crate
pub const DEFAULT_LOG_DIRECTIVE: &str = "tempsim=info";

/// Install the global `tracing` subscriber.
///
/// Honors `RUST_LOG` and adds `tempsim=info`. Calling it again is a no-op.
pub fn init_tracing() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = DEFAULT_LOG_DIRECTIVE.parse() {
        filter = filter.add_directive(directive);
    }

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_info_is_present() {
        assert!(!VERSION.is_empty());
        assert!(!BUILD_TIMESTAMP.is_empty());
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
