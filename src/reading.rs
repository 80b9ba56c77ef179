// src/reading.rs - Telemetry payload emitted on every enabled tick

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One simulated sample. Built fresh each tick and dropped after publishing.
///
/// Serializes to the fixed wire schema:
///
/// ```json
/// { "machine": {"temperature": 21.3, "pressure": 13.9},
///   "ambient": {"temperature": 10.2, "humidity": 25},
///   "timeCreated": "2024-01-01T00:00:00Z" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Simulated machine sensor
    pub machine: MachineReading,
    /// Simulated room sensor
    pub ambient: AmbientReading,
    /// UTC time the reading was generated
    #[serde(rename = "timeCreated")]
    pub time_created: DateTime<Utc>,
}

/// Machine half of a [`Reading`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MachineReading {
    /// Degrees, following the random walk
    pub temperature: f64,
    /// Linear in `temperature` across the configured pressure band
    pub pressure: f64,
}

/// Ambient half of a [`Reading`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AmbientReading {
    /// Configured ambient temperature plus up to half a degree of noise
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: i32,
}

impl Reading {
    /// Encode as the UTF-8 JSON message body
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
