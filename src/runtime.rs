// src/runtime.rs - Live emission settings shared by the emit loop and the twin handlers

use crate::{
    config::RuntimeSettings,
    error::{Result, SimError},
    twin::{self, Reconciliation, TwinPatch},
};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Currently applied `SendData` / `SendInterval`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeConfig {
    /// `SendData`: publish readings when set
    pub send_enabled: bool,
    send_interval_secs: u64,
}

impl RuntimeConfig {
    /// Build a config; the interval must be at least one second
    pub fn new(send_enabled: bool, send_interval_secs: u64) -> Result<Self> {
        if send_interval_secs == 0 {
            return Err(SimError::Config("send interval must be at least 1 second".into()));
        }
        Ok(Self {
            send_enabled,
            send_interval_secs,
        })
    }

    /// `SendInterval` in whole seconds
    pub fn send_interval_secs(&self) -> u64 {
        self.send_interval_secs
    }

    /// Wait between ticks
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.send_interval_secs)
    }

    /// Same config with a new interval; `None` when the interval is not positive
    pub fn with_interval(self, send_interval_secs: u64) -> Option<Self> {
        (send_interval_secs > 0).then_some(Self {
            send_interval_secs,
            ..self
        })
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            send_enabled: true,
            send_interval_secs: 3,
        }
    }
}

impl TryFrom<&RuntimeSettings> for RuntimeConfig {
    type Error = SimError;

    fn try_from(settings: &RuntimeSettings) -> Result<Self> {
        Self::new(settings.send_data, settings.send_interval_secs)
    }
}

/// Shared, lock-guarded [`RuntimeConfig`].
///
/// The emit loop takes one [`snapshot`](Self::snapshot) per tick; the twin
/// handler applies a whole patch under a single write lock so the loop never
/// observes half of it.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<RuntimeConfig>>,
}

impl ConfigStore {
    /// Store holding `initial`
    pub fn new(initial: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Copy of the live config
    pub fn snapshot(&self) -> RuntimeConfig {
        *self.inner.read()
    }

    /// Swap in a whole config, e.g. after the twin bootstrap
    pub fn replace(&self, config: RuntimeConfig) {
        *self.inner.write() = config;
    }

    /// Reconcile a desired-properties patch against the live config
    pub fn apply_patch(&self, patch: &TwinPatch) -> Reconciliation {
        let mut guard = self.inner.write();
        let result = twin::reconcile(&guard, patch);
        if result.config != *guard {
            info!(
                send_data = result.config.send_enabled,
                send_interval_secs = result.config.send_interval_secs,
                version = patch.version,
                "runtime configuration updated"
            );
        } else {
            debug!(version = patch.version, "desired patch left runtime configuration unchanged");
        }
        *guard = result.config;
        result
    }
}
