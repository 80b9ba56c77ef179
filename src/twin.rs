// src/twin.rs - Desired/reported property reconciliation
//
// A desired patch is reconciled key by key against the live RuntimeConfig.
// Every key that is applied produces an acknowledgment entry for the reported
// properties channel; a key that cannot be parsed is dropped without one.

use crate::{
    error::{Result, SimError},
    runtime::RuntimeConfig,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Desired property carrying the tick interval in seconds
pub const SEND_INTERVAL: &str = "SendInterval";
/// Desired property enabling or disabling publishing
pub const SEND_DATA: &str = "SendData";

const VERSION_KEY: &str = "$version";

/// Acknowledgment status codes (`ac`)
pub mod status {
    /// Applied from a desired value
    pub const OK: u16 = 200;
    /// Cold read found only a reported value
    pub const FOUND_IN_REPORTED: u16 = 202;
    /// Cold read found nothing, compiled-in default applied
    pub const DEFAULTED: u16 = 100;
    /// Patch value rejected; recorded locally, never sent
    pub const REJECTED: u16 = 400;
    /// Cold read found a desired value it could not parse
    pub const DESIRED_UNPARSABLE: u16 = 501;
    /// Cold read found a reported value it could not parse
    pub const REPORTED_UNPARSABLE: u16 = 502;
}

// ============================================================================
// TWIN COLLECTIONS
// ============================================================================

/// A versioned set of twin properties.
///
/// Used both for a desired-properties patch and for the desired/reported
/// sections of a full twin document. `$`-prefixed metadata keys are stripped;
/// `$version` becomes [`version`](Self::version).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TwinCollection {
    /// `$version` of the collection, 0 when absent
    pub version: i64,
    /// Properties without metadata keys
    pub properties: Map<String, Value>,
}

/// A desired-properties patch pushed by the remote side
pub type TwinPatch = TwinCollection;

impl TwinCollection {
    /// Collection from already-stripped properties
    pub fn new(version: i64, properties: Map<String, Value>) -> Self {
        Self { version, properties }
    }

    /// Build from a JSON object, reading `$version` when present
    pub fn from_json(value: Value) -> Result<Self> {
        Self::from_json_with_version(value, None)
    }

    /// Build from a JSON object; `version_hint` is used when the body carries
    /// no `$version` (some brokers put it in the topic instead)
    pub fn from_json_with_version(value: Value, version_hint: Option<i64>) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(SimError::Config("twin properties must be a JSON object".into()));
        };

        let version = map
            .get(VERSION_KEY)
            .and_then(Value::as_i64)
            .or(version_hint)
            .unwrap_or_default();

        let properties = map
            .into_iter()
            .filter(|(key, _)| !key.starts_with('$'))
            .collect();

        Ok(Self { version, properties })
    }

    /// Parse a UTF-8 JSON body
    pub fn from_slice(bytes: &[u8], version_hint: Option<i64>) -> Result<Self> {
        Self::from_json_with_version(serde_json::from_slice(bytes)?, version_hint)
    }

    /// Whether `name` is present at all
    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    /// Property value, unwrapping `{"value": ...}` envelopes such as a
    /// previously reported acknowledgment
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name).map(|raw| match raw {
            Value::Object(inner) => inner.get("value").unwrap_or(raw),
            other => other,
        })
    }
}

/// Desired and reported sections of a device twin
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TwinDocument {
    /// Values requested by the remote side
    pub desired: TwinCollection,
    /// Values last reported by the device
    pub reported: TwinCollection,
}

impl TwinDocument {
    /// Accepts `{"desired":..,"reported":..}` or the same nested under `"properties"`
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(mut root) = value else {
            return Err(SimError::Config("twin document must be a JSON object".into()));
        };
        if let Some(Value::Object(properties)) = root.remove("properties") {
            root = properties;
        }

        let mut section = |name: &str| match root.remove(name) {
            Some(value) => TwinCollection::from_json(value),
            None => Ok(TwinCollection::default()),
        };

        Ok(Self {
            desired: section("desired")?,
            reported: section("reported")?,
        })
    }

    /// Parse a UTF-8 JSON twin document
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Self::from_json(serde_json::from_slice(bytes)?)
    }
}

// ============================================================================
// ACKNOWLEDGMENTS
// ============================================================================

/// Acknowledgment of one property on the reported channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AckEntry {
    /// Status code, see [`status`]
    #[serde(rename = "ac")]
    pub status: u16,
    /// Desired version being acknowledged
    #[serde(rename = "av")]
    pub version: i64,
    /// Human-readable detail for non-200 statuses
    #[serde(rename = "ad", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Value now in effect
    pub value: Value,
}

impl AckEntry {
    /// Successful application of a desired value
    pub fn applied(version: i64, value: impl Into<Value>) -> Self {
        Self {
            status: status::OK,
            version,
            description: None,
            value: value.into(),
        }
    }

    fn described(status: u16, version: i64, description: &str, value: impl Into<Value>) -> Self {
        Self {
            status,
            version,
            description: Some(description.to_string()),
            value: value.into(),
        }
    }
}

/// Acknowledgments keyed by property name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Acks {
    entries: BTreeMap<String, AckEntry>,
}

impl Acks {
    /// Add or replace the entry for `name`
    pub fn insert(&mut self, name: impl Into<String>, entry: AckEntry) {
        self.entries.insert(name.into(), entry);
    }

    /// Entry for `name`
    pub fn get(&self, name: &str) -> Option<&AckEntry> {
        self.entries.get(name)
    }

    /// Number of acknowledged properties
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing needs reporting
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reported-properties patch body, e.g.
    /// `{"SendInterval": {"ac": 200, "av": 4, "value": 10}}`
    pub fn to_reported(&self) -> Value {
        let map = self
            .entries
            .iter()
            .map(|(name, entry)| {
                let value = serde_json::to_value(entry).unwrap_or(Value::Null);
                (name.clone(), value)
            })
            .collect();
        Value::Object(map)
    }
}

// ============================================================================
// PATCH RECONCILIATION
// ============================================================================

/// What happened to one recognized key of a patch
#[derive(Debug, Clone, PartialEq)]
pub enum KeyOutcome {
    /// Applied and acknowledged
    Applied(AckEntry),
    /// Left the previous value in place; no acknowledgment is sent
    Rejected {
        /// Local status, [`status::REJECTED`]
        status: u16,
        /// Why the value could not be used
        reason: String,
    },
}

/// Result of reconciling one patch
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// Config after applying every accepted key
    pub config: RuntimeConfig,
    /// Entries to send as reported properties
    pub acks: Acks,
    /// Per-key results, in processing order
    pub outcomes: Vec<(String, KeyOutcome)>,
}

impl Reconciliation {
    /// Keys that were present but not applied
    pub fn rejected(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes.iter().filter_map(|(key, outcome)| match outcome {
            KeyOutcome::Rejected { reason, .. } => Some((key.as_str(), reason.as_str())),
            KeyOutcome::Applied(_) => None,
        })
    }
}

/// Reconcile a desired patch against the current config.
///
/// Each recognized key is handled on its own: a bad `SendInterval` does not
/// stop a valid `SendData` in the same patch. Unrecognized keys are ignored.
pub fn reconcile(current: &RuntimeConfig, patch: &TwinPatch) -> Reconciliation {
    let mut config = *current;
    let mut acks = Acks::default();
    let mut outcomes = Vec::new();

    if let Some(raw) = patch.property(SEND_INTERVAL) {
        let parsed = parse_interval(raw).and_then(|secs| {
            config
                .with_interval(secs)
                .ok_or_else(|| format!("interval {} is not positive", secs))
        });
        match parsed {
            Ok(updated) => {
                config = updated;
                let ack = AckEntry::applied(patch.version, updated.send_interval_secs());
                acks.insert(SEND_INTERVAL, ack.clone());
                outcomes.push((SEND_INTERVAL.to_string(), KeyOutcome::Applied(ack)));
            }
            Err(reason) => {
                warn!(
                    key = SEND_INTERVAL,
                    version = patch.version,
                    "cannot parse desired value ({}); keeping {}s",
                    reason,
                    config.send_interval_secs()
                );
                outcomes.push((
                    SEND_INTERVAL.to_string(),
                    KeyOutcome::Rejected { status: status::REJECTED, reason },
                ));
            }
        }
    }

    if let Some(raw) = patch.property(SEND_DATA) {
        match parse_flag(raw) {
            Ok(enabled) => {
                config.send_enabled = enabled;
                if !enabled {
                    info!("Sending data disabled. Change twin configuration to start sending again.");
                }
                let ack = AckEntry::applied(patch.version, enabled);
                acks.insert(SEND_DATA, ack.clone());
                outcomes.push((SEND_DATA.to_string(), KeyOutcome::Applied(ack)));
            }
            Err(reason) => {
                warn!(key = SEND_DATA, version = patch.version, "cannot parse desired value ({})", reason);
                outcomes.push((
                    SEND_DATA.to_string(),
                    KeyOutcome::Rejected { status: status::REJECTED, reason },
                ));
            }
        }
    }

    for key in patch.properties.keys() {
        if key != SEND_INTERVAL && key != SEND_DATA {
            debug!(key = %key, "ignoring unrecognized desired property");
        }
    }

    Reconciliation { config, acks, outcomes }
}

/// Positive whole number of seconds, from a JSON number or numeric string
pub fn parse_interval(value: &Value) -> std::result::Result<u64, String> {
    let secs = match value {
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                v
            } else if let Some(v) = n.as_f64().filter(|v| v.fract() == 0.0 && v.abs() < i64::MAX as f64) {
                v as i64
            } else {
                return Err(format!("{} is not a whole number of seconds", n));
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("'{}' is not a whole number of seconds", s))?,
        other => return Err(format!("expected a number, got {}", other)),
    };
    u64::try_from(secs)
        .ok()
        .filter(|secs| *secs > 0)
        .ok_or_else(|| format!("interval must be positive, got {}", secs))
}

/// Boolean from a JSON bool, `"true"`/`"false"` or a number (0 = false)
pub fn parse_flag(value: &Value) -> std::result::Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) if s.trim().eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.trim().eq_ignore_ascii_case("false") => Ok(false),
        Value::Number(n) => n
            .as_f64()
            .map(|v| v != 0.0)
            .ok_or_else(|| format!("{} is not a flag", n)),
        other => Err(format!("expected a boolean, got {}", other)),
    }
}

// ============================================================================
// COLD READ (startup)
// ============================================================================

/// Resolve one property from a full twin at startup.
///
/// Desired wins over reported, reported over `default`. The acknowledgment
/// records which source was used so the remote side can audit it.
pub fn read_property<T, P>(twin: &TwinDocument, name: &str, default: T, parse: P) -> (T, AckEntry)
where
    T: Copy + Into<Value>,
    P: Fn(&Value) -> std::result::Result<T, String>,
{
    if let Some(raw) = twin.desired.property(name) {
        return match parse(raw) {
            Ok(value) => (
                value,
                AckEntry::described(status::OK, twin.desired.version, "Found in desired", value),
            ),
            Err(reason) => {
                warn!(property = name, "Cannot parse desired ({})", reason);
                (
                    default,
                    AckEntry::described(
                        status::DESIRED_UNPARSABLE,
                        1,
                        "Found in desired but cannot parse",
                        default,
                    ),
                )
            }
        };
    }

    if let Some(raw) = twin.reported.property(name) {
        return match parse(raw) {
            Ok(value) => (
                value,
                AckEntry::described(status::FOUND_IN_REPORTED, 1, "Found in reported", value),
            ),
            Err(reason) => {
                warn!(property = name, "Cannot parse reported ({})", reason);
                (
                    default,
                    AckEntry::described(
                        status::REPORTED_UNPARSABLE,
                        1,
                        "Found in reported but cannot parse",
                        default,
                    ),
                )
            }
        };
    }

    info!(property = name, "prop not found, applying defaults");
    (
        default,
        AckEntry::described(status::DEFAULTED, 1, "prop not found, applying defaults", default),
    )
}

/// Derive the startup config from a twin, falling back to `defaults`
pub fn bootstrap_runtime_config(twin: &TwinDocument, defaults: RuntimeConfig) -> (RuntimeConfig, Acks) {
    let (send_enabled, data_ack) = read_property(twin, SEND_DATA, defaults.send_enabled, parse_flag);
    let (interval, interval_ack) =
        read_property(twin, SEND_INTERVAL, defaults.send_interval_secs(), parse_interval);

    let mut config = defaults.with_interval(interval).unwrap_or(defaults);
    config.send_enabled = send_enabled;

    let mut acks = Acks::default();
    acks.insert(SEND_DATA, data_ack);
    acks.insert(SEND_INTERVAL, interval_ack);
    (config, acks)
}
