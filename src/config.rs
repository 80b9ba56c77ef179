// src/config.rs - Simulator, runtime and broker configuration

use crate::error::{Result, SimError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

// ============================================================================
// MAIN CONFIGURATION
// ============================================================================

/// Main tempsim configuration
///
/// Every section is optional in the YAML file; missing sections fall back to
/// the compiled-in defaults used when no external configuration is reachable.
///
/// ```rust
/// use tempsim::Config;
///
/// let config = Config::from_yaml("runtime:\n  send_interval_secs: 5\n")?;
/// assert_eq!(config.runtime.send_interval_secs, 5);
/// assert_eq!(config.simulator.machine_temp_max, 50.0);
/// # Ok::<(), tempsim::SimError>(())
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Random walk bounds
    #[serde(default)]
    pub simulator: SimulationBounds,

    /// Initial emission settings
    #[serde(default)]
    pub runtime: RuntimeSettings,

    /// Broker connection
    #[serde(default)]
    pub mqtt: MqttConfig,
}

impl Config {
    /// Load and validate a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(config_path = %path.display(), "loading configuration");
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SimError::Config(format!("unable to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check structural invariants.
    ///
    /// Equal temperature bounds are accepted; the generator treats them as a
    /// flat pressure curve.
    pub fn validate(&self) -> Result<()> {
        self.simulator.validate()?;
        self.runtime.validate()?;
        self.mqtt.validate()
    }

    /// Apply `TEMPSIM_*` environment overrides for the broker section
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_MQTT_HOST) {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup(ENV_MQTT_PORT) {
            self.mqtt.port = port.trim().parse().map_err(|_| {
                SimError::Config(format!("{} must be a port number, got '{}'", ENV_MQTT_PORT, port))
            })?;
        }
        if let Some(device_id) = lookup(ENV_DEVICE_ID) {
            self.mqtt.device_id = device_id;
        }
        if let Some(module_id) = lookup(ENV_MODULE_ID) {
            self.mqtt.module_id = module_id;
        }
        Ok(())
    }
}

/// Broker host override
pub const ENV_MQTT_HOST: &str = "TEMPSIM_MQTT_HOST";
/// Broker port override
pub const ENV_MQTT_PORT: &str = "TEMPSIM_MQTT_PORT";
/// Device identity override
pub const ENV_DEVICE_ID: &str = "TEMPSIM_DEVICE_ID";
/// Module identity override
pub const ENV_MODULE_ID: &str = "TEMPSIM_MODULE_ID";

// ============================================================================
// SIMULATOR CONFIGURATION
// ============================================================================

/// Bounds of the simulated machine. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationBounds {
    /// Lower temperature bound, also the reset temperature
    #[serde(default = "default_machine_temp_min")]
    pub machine_temp_min: f64,

    /// Temperature above which the walk stops drifting upward
    #[serde(default = "default_machine_temp_max")]
    pub machine_temp_max: f64,

    /// Pressure reported at `machine_temp_min`
    #[serde(default = "default_machine_pressure_min")]
    pub machine_pressure_min: f64,

    /// Pressure reported at `machine_temp_max`
    #[serde(default = "default_machine_pressure_max")]
    pub machine_pressure_max: f64,

    /// Centre of the ambient temperature jitter
    #[serde(default = "default_ambient_temp")]
    pub ambient_temp: f64,

    /// Carried for compatibility; the humidity draw does not read it
    #[serde(default = "default_humidity_percent")]
    pub humidity_percent: i32,
}

impl Default for SimulationBounds {
    fn default() -> Self {
        Self {
            machine_temp_min: default_machine_temp_min(),
            machine_temp_max: default_machine_temp_max(),
            machine_pressure_min: default_machine_pressure_min(),
            machine_pressure_max: default_machine_pressure_max(),
            ambient_temp: default_ambient_temp(),
            humidity_percent: default_humidity_percent(),
        }
    }
}

impl SimulationBounds {
    fn validate(&self) -> Result<()> {
        let values = [
            self.machine_temp_min,
            self.machine_temp_max,
            self.machine_pressure_min,
            self.machine_pressure_max,
            self.ambient_temp,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(SimError::Config("simulator bounds must be finite numbers".into()));
        }
        if self.machine_temp_min > self.machine_temp_max {
            return Err(SimError::Config(format!(
                "machine_temp_min ({}) is above machine_temp_max ({})",
                self.machine_temp_min, self.machine_temp_max
            )));
        }
        if self.machine_pressure_min > self.machine_pressure_max {
            return Err(SimError::Config(format!(
                "machine_pressure_min ({}) is above machine_pressure_max ({})",
                self.machine_pressure_min, self.machine_pressure_max
            )));
        }
        Ok(())
    }
}

// ============================================================================
// RUNTIME CONFIGURATION
// ============================================================================

/// Emission settings applied at startup, before any desired property arrives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Publish readings (`SendData`)
    #[serde(default = "default_true")]
    pub send_data: bool,

    /// Seconds between ticks (`SendInterval`)
    #[serde(default = "default_send_interval")]
    pub send_interval_secs: u64,

    /// Stop emitting after this many messages (None = unlimited)
    #[serde(default)]
    pub max_messages: Option<u64>,

    /// Derive the initial settings from the device twin instead of the values above
    #[serde(default)]
    pub bootstrap_from_twin: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            send_data: default_true(),
            send_interval_secs: default_send_interval(),
            max_messages: None,
            bootstrap_from_twin: false,
        }
    }
}

impl RuntimeSettings {
    fn validate(&self) -> Result<()> {
        if self.send_interval_secs == 0 {
            return Err(SimError::Config("send_interval_secs must be at least 1".into()));
        }
        Ok(())
    }
}

// ============================================================================
// MQTT CONFIGURATION
// ============================================================================

/// Broker connection and topic naming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Device identity, also used as the MQTT client id prefix
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Module identity (empty for a plain device connection)
    #[serde(default = "default_module_id")]
    pub module_id: String,

    /// Keep alive in seconds
    #[serde(default = "default_mqtt_keepalive")]
    pub keepalive_secs: u64,

    /// Seconds to wait for the initial CONNACK
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Seconds to wait for a twin GET response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Digital twin model id announced on connect
    #[serde(default = "default_model_id")]
    pub model_id: Option<String>,

    /// QoS level
    #[serde(default)]
    pub qos: MqttQos,

    /// Output name telemetry is sent to
    #[serde(default = "default_telemetry_output")]
    pub telemetry_output: String,

    /// Input name whose messages are relayed
    #[serde(default = "default_passthrough_input")]
    pub passthrough_input: String,

    /// Output name relayed messages are sent to
    #[serde(default = "default_passthrough_output")]
    pub passthrough_output: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            device_id: default_device_id(),
            module_id: default_module_id(),
            keepalive_secs: default_mqtt_keepalive(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            model_id: default_model_id(),
            qos: MqttQos::default(),
            telemetry_output: default_telemetry_output(),
            passthrough_input: default_passthrough_input(),
            passthrough_output: default_passthrough_output(),
        }
    }
}

impl MqttConfig {
    fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(SimError::Config("mqtt.device_id must not be empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(SimError::Config("mqtt.host must not be empty".into()));
        }
        if self.telemetry_output.trim().is_empty() {
            return Err(SimError::Config("mqtt.telemetry_output must not be empty".into()));
        }
        Ok(())
    }

    /// MQTT client id (`device/module` for module identities)
    pub fn client_id(&self) -> String {
        if self.module_id.is_empty() {
            self.device_id.clone()
        } else {
            format!("{}/{}", self.device_id, self.module_id)
        }
    }
}

/// MQTT QoS levels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MqttQos {
    /// QoS 0
    AtMostOnce,
    /// QoS 1
    #[default]
    AtLeastOnce,
    /// QoS 2
    ExactlyOnce,
}

// ============================================================================
// DEFAULT VALUE FUNCTIONS
// ============================================================================

fn default_true() -> bool { true }
fn default_send_interval() -> u64 { 3 }
fn default_machine_temp_min() -> f64 { 20.0 }
fn default_machine_temp_max() -> f64 { 50.0 }
fn default_machine_pressure_min() -> f64 { 10.0 }
fn default_machine_pressure_max() -> f64 { 100.0 }
fn default_ambient_temp() -> f64 { 10.0 }
fn default_humidity_percent() -> i32 { 80 }
fn default_mqtt_host() -> String { "localhost".to_string() }
fn default_mqtt_port() -> u16 { 1883 }
fn default_device_id() -> String { "tempsim-device".to_string() }
fn default_module_id() -> String { "SimulatedTemperatureSensor".to_string() }
fn default_mqtt_keepalive() -> u64 { 60 }
fn default_connect_timeout() -> u64 { 30 }
fn default_request_timeout() -> u64 { 10 }
fn default_model_id() -> Option<String> { Some("dtmi:rido:sts;1".to_string()) }
fn default_telemetry_output() -> String { "temperatureOutput".to_string() }
fn default_passthrough_input() -> String { "input1".to_string() }
fn default_passthrough_output() -> String { "output1".to_string() }
