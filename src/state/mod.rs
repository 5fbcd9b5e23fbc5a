//! # Device State Model
//!
//! Typed representation of the merged WLANThermo state document. The device
//! pushes partial JSON fragments on two topics; this module defines the
//! document they are merged into and the per-object rules for applying a
//! single key.
//!
//! ## Layout
//!
//! ```text
//! DeviceState
//! ├── system      SystemState            shallow per-key merge
//! ├── channel     [ChannelState]         positional merge, grow only
//! ├── pitmaster   PitmasterDocument
//! │   ├── pm      [PitmasterState]       positional merge, grow only
//! │   └── extra   sibling keys           last write wins
//! ├── pid / sensors / iot                replaced wholesale
//! └── extra       unknown top-level keys replaced wholesale
//! ```
//!
//! Every object level carries an `extra` map. Known keys are decoded into
//! typed fields; a value with an unexpected JSON type is kept in `extra`
//! under its original key so it still passes through. A key lives in exactly
//! one of the two places at any time.
//!
//! Numeric fields hold a [`serde_json::Number`] so integers stay integers and
//! the document serializes back exactly as received; the `f64` accessors are
//! for readers. Arrays are optional, so a received `[]` is kept as well.

pub mod aggregator;
pub mod device_info;
pub mod liveness;

pub use aggregator::{ListenerId, StateAggregator, StateListener};
pub use device_info::DeviceInfo;
pub use liveness::LivenessTransition;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::debug;

/// Temperature the device reports for a channel without a probe attached
pub const TEMP_DISCONNECTED: f64 = 999.0;

/// Which inbound stream a fragment arrived on
///
/// Both kinds go through the same merge policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Data,
    Settings,
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FragmentKind::Data => write!(f, "data"),
            FragmentKind::Settings => write!(f, "settings"),
        }
    }
}

/// Operating mode of a pitmaster controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PitmasterMode {
    Off,
    Manual,
    Auto,
}

impl PitmasterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PitmasterMode::Off => "off",
            PitmasterMode::Manual => "manual",
            PitmasterMode::Auto => "auto",
        }
    }
}

impl fmt::Display for PitmasterMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PitmasterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(PitmasterMode::Off),
            "manual" => Ok(PitmasterMode::Manual),
            "auto" => Ok(PitmasterMode::Auto),
            other => Err(format!("unknown pitmaster mode '{}'", other)),
        }
    }
}

/// Applies one incoming key at a time onto a stored object
///
/// Implementors own a set of typed fields plus an `extra` bucket. Absent keys
/// are never touched, which makes `merge_object` a shallow per-key merge.
pub trait FieldMerge: Default {
    fn apply_field(&mut self, key: &str, value: Value);

    fn merge_object(&mut self, fragment: Map<String, Value>) {
        for (key, value) in fragment {
            self.apply_field(&key, value);
        }
    }
}

/// Decodes `value` into a typed slot, falling back to `extra` on a type mismatch
fn set_typed<T: DeserializeOwned>(
    slot: &mut Option<T>,
    extra: &mut Map<String, Value>,
    key: &str,
    value: Value,
) {
    if value.is_null() {
        *slot = None;
        extra.remove(key);
        return;
    }

    match serde_json::from_value::<T>(value.clone()) {
        Ok(typed) => {
            *slot = Some(typed);
            extra.remove(key);
        }
        Err(e) => {
            debug!("Keeping '{}' as opaque value: {}", key, e);
            *slot = None;
            extra.insert(key.to_string(), value);
        }
    }
}

fn number_f64(number: &Option<Number>) -> Option<f64> {
    number.as_ref().and_then(Number::as_f64)
}

/// Grows `items` with default elements until it holds at least `len` entries
///
/// Never shrinks.
pub fn ensure_len<T: Default>(items: &mut Vec<T>, len: usize) {
    if items.len() < len {
        items.resize_with(len, T::default);
    }
}

/// Scalar system fields reported by the device
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soc: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SystemState {
    /// Battery charge in percent
    pub fn battery_level(&self) -> Option<f64> {
        number_f64(&self.soc)
    }

    /// WiFi signal strength in dBm
    pub fn signal_strength(&self) -> Option<f64> {
        number_f64(&self.rssi)
    }

    pub fn cpu_load(&self) -> Option<f64> {
        number_f64(&self.cpu)
    }
}

impl FieldMerge for SystemState {
    fn apply_field(&mut self, key: &str, value: Value) {
        let extra = &mut self.extra;
        match key {
            "online" => set_typed(&mut self.online, extra, key, value),
            "soc" => set_typed(&mut self.soc, extra, key, value),
            "charge" => set_typed(&mut self.charge, extra, key, value),
            "rssi" => set_typed(&mut self.rssi, extra, key, value),
            "cpu" => set_typed(&mut self.cpu, extra, key, value),
            "hw_version" => set_typed(&mut self.hw_version, extra, key, value),
            "sw_version" => set_typed(&mut self.sw_version, extra, key, value),
            "ip" => set_typed(&mut self.ip, extra, key, value),
            _ => {
                extra.insert(key.to_string(), value);
            }
        }
    }
}

/// One temperature channel, addressed by its position in `channel`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Raw reading; 999 means no probe attached, see [`ChannelState::temperature`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alarm: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typ: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChannelState {
    /// Current reading, or `None` when the probe is missing or nothing was reported
    pub fn temperature(&self) -> Option<f64> {
        number_f64(&self.temp).filter(|t| *t != TEMP_DISCONNECTED)
    }

    /// Lower alarm limit
    pub fn min_temp(&self) -> Option<f64> {
        number_f64(&self.min)
    }

    /// Upper alarm limit
    pub fn max_temp(&self) -> Option<f64> {
        number_f64(&self.max)
    }

    pub fn is_connected(&self) -> bool {
        self.temperature().is_some()
    }
}

impl FieldMerge for ChannelState {
    fn apply_field(&mut self, key: &str, value: Value) {
        let extra = &mut self.extra;
        match key {
            "name" => set_typed(&mut self.name, extra, key, value),
            "temp" => set_typed(&mut self.temp, extra, key, value),
            "min" => set_typed(&mut self.min, extra, key, value),
            "max" => set_typed(&mut self.max, extra, key, value),
            "alarm" => set_typed(&mut self.alarm, extra, key, value),
            "color" => set_typed(&mut self.color, extra, key, value),
            "typ" => set_typed(&mut self.typ, extra, key, value),
            "enabled" => set_typed(&mut self.enabled, extra, key, value),
            _ => {
                extra.insert(key.to_string(), value);
            }
        }
    }
}

/// One pitmaster controller, addressed by its position in `pitmaster.pm`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PitmasterState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typ: Option<PitmasterMode>,
    /// 1-based index into `channel`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set: Option<Number>,
    /// Actuator output in percent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Number>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PitmasterState {
    pub fn mode(&self) -> Option<PitmasterMode> {
        self.typ
    }

    /// Target temperature
    pub fn setpoint(&self) -> Option<f64> {
        number_f64(&self.set)
    }

    /// Actuator output in percent
    pub fn output(&self) -> Option<f64> {
        number_f64(&self.value)
    }
}

impl FieldMerge for PitmasterState {
    fn apply_field(&mut self, key: &str, value: Value) {
        let extra = &mut self.extra;
        match key {
            "typ" => set_typed(&mut self.typ, extra, key, value),
            "channel" => set_typed(&mut self.channel, extra, key, value),
            "pid" => set_typed(&mut self.pid, extra, key, value),
            "set" => set_typed(&mut self.set, extra, key, value),
            "value" => set_typed(&mut self.value, extra, key, value),
            _ => {
                extra.insert(key.to_string(), value);
            }
        }
    }
}

/// The `pitmaster` object: the `pm` array plus independently assigned siblings
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PitmasterDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pm: Option<Vec<PitmasterState>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PitmasterDocument {
    /// The controllers received so far; empty when `pm` never arrived
    pub fn controllers(&self) -> &[PitmasterState] {
        self.pm.as_deref().unwrap_or(&[])
    }
}

impl FieldMerge for PitmasterDocument {
    fn apply_field(&mut self, key: &str, value: Value) {
        if key != "pm" {
            self.extra.insert(key.to_string(), value);
            return;
        }

        match value {
            Value::Array(items) => {
                merge_positional(self.pm.get_or_insert_with(Vec::new), items, "pitmaster.pm")
            }
            other => debug!(
                "Ignoring pitmaster.pm that is not an array: {}",
                json_type(&other)
            ),
        }
    }
}

/// Index-addressed merge used for `channel` and `pitmaster.pm`
///
/// Element `i` of `incoming` updates element `i` of `stored`. The stored
/// vector grows to the incoming length first and never shrinks. Elements that
/// are not objects leave their slot untouched.
pub fn merge_positional<T: FieldMerge>(stored: &mut Vec<T>, incoming: Vec<Value>, what: &str) {
    ensure_len(stored, incoming.len());

    for (idx, item) in incoming.into_iter().enumerate() {
        match item {
            Value::Object(map) => stored[idx].merge_object(map),
            Value::Null => {}
            other => debug!(
                "Skipping {}[{}]: expected object, got {}",
                what,
                idx,
                json_type(&other)
            ),
        }
    }
}

/// Short name of a JSON value's type for log lines and errors
pub fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The merged device document
///
/// Serializes back to the device's JSON shape. `last_update` is bookkeeping
/// for the liveness monitor and is not part of the JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<Vec<ChannelState>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitmaster: Option<PitmasterDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensors: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iot: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(skip)]
    pub last_update: Option<DateTime<Utc>>,
}

impl DeviceState {
    /// True until the first fragment has been merged
    pub fn is_empty(&self) -> bool {
        self.system.is_none()
            && self.channel.is_none()
            && self.pitmaster.is_none()
            && self.pid.is_none()
            && self.sensors.is_none()
            && self.iot.is_none()
            && self.extra.is_empty()
    }

    /// `system.online`, if the device has reported or been judged either way
    pub fn is_online(&self) -> Option<bool> {
        self.system.as_ref().and_then(|s| s.online)
    }

    /// The channels received so far; empty when `channel` never arrived
    pub fn channels(&self) -> &[ChannelState] {
        self.channel.as_deref().unwrap_or(&[])
    }

    pub fn channel(&self, index: usize) -> Option<&ChannelState> {
        self.channels().get(index)
    }

    pub fn pitmaster(&self, index: usize) -> Option<&PitmasterState> {
        self.pitmaster
            .as_ref()
            .and_then(|p| p.controllers().get(index))
    }

    /// Reporting interval in seconds from `iot.PMQint`, when it is a positive integer
    ///
    /// Accepts a JSON number or a numeric string.
    pub fn report_interval(&self) -> Option<u64> {
        let raw = self.iot.as_ref()?.get("PMQint")?;
        let secs = match raw {
            Value::Number(n) => n.as_u64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f > 0.0)
                    .map(|f| f as u64)
            }),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        }?;
        (secs > 0).then_some(secs)
    }

    /// The document as a JSON value in the device's shape
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Address of one leaf written by an optimistic update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPath {
    System { field: String },
    Channel { index: usize, field: String },
    Pitmaster { index: usize, field: String },
}

impl FieldPath {
    pub fn system(field: impl Into<String>) -> Self {
        FieldPath::System {
            field: field.into(),
        }
    }

    pub fn channel(index: usize, field: impl Into<String>) -> Self {
        FieldPath::Channel {
            index,
            field: field.into(),
        }
    }

    pub fn pitmaster(index: usize, field: impl Into<String>) -> Self {
        FieldPath::Pitmaster {
            index,
            field: field.into(),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            FieldPath::System { field }
            | FieldPath::Channel { field, .. }
            | FieldPath::Pitmaster { field, .. } => field,
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldPath::System { field } => write!(f, "system.{}", field),
            FieldPath::Channel { index, field } => write!(f, "channel[{}].{}", index, field),
            FieldPath::Pitmaster { index, field } => {
                write!(f, "pitmaster.pm[{}].{}", index, field)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("test fixture must be an object"),
        }
    }

    #[test]
    fn channel_fields_merge_shallowly() {
        let mut channel = ChannelState::default();
        channel.merge_object(object(json!({"name": "Kerntemp", "temp": 21.5, "min": 10})));
        channel.merge_object(object(json!({"temp": 22.0})));

        assert_eq!(channel.name.as_deref(), Some("Kerntemp"));
        assert_eq!(channel.temperature(), Some(22.0));
        assert_eq!(channel.min, Some(Number::from(10)));
        assert_eq!(channel.to_json_for_test()["min"], json!(10));
    }

    #[test]
    fn mistyped_field_moves_to_extra_and_back() {
        let mut channel = ChannelState::default();
        channel.apply_field("alarm", json!(true));
        channel.apply_field("alarm", json!(3));

        assert_eq!(channel.alarm, None);
        assert_eq!(channel.extra.get("alarm"), Some(&json!(3)));
        assert_eq!(channel.to_json_for_test(), json!({"alarm": 3}));

        channel.apply_field("alarm", json!(false));
        assert_eq!(channel.alarm, Some(false));
        assert!(channel.extra.is_empty());
    }

    #[test]
    fn null_clears_typed_field() {
        let mut system = SystemState::default();
        system.apply_field("ip", json!("192.168.0.17"));
        system.apply_field("ip", Value::Null);
        assert_eq!(system.ip, None);
    }

    #[test]
    fn unknown_fields_pass_through() {
        let mut system = SystemState::default();
        system.merge_object(object(json!({"unit": "C", "api_version": "1"})));
        assert_eq!(system.extra.get("unit"), Some(&json!("C")));
        assert_eq!(system.extra.get("api_version"), Some(&json!("1")));
    }

    #[test]
    fn sentinel_temperature_is_unavailable() {
        let mut channel = ChannelState::default();
        channel.apply_field("temp", json!(999));
        assert_eq!(channel.temp, Some(Number::from(999)));
        assert_eq!(channel.temperature(), None);
        assert!(!channel.is_connected());

        channel.apply_field("temp", json!(98.6));
        assert_eq!(channel.temperature(), Some(98.6));

        assert_eq!(ChannelState::default().temperature(), None);
    }

    #[test]
    fn ensure_len_only_grows() {
        let mut items: Vec<ChannelState> = Vec::new();
        ensure_len(&mut items, 3);
        assert_eq!(items.len(), 3);
        ensure_len(&mut items, 1);
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn pitmaster_mode_parses_and_rejects() {
        let mut pm = PitmasterState::default();
        pm.apply_field("typ", json!("auto"));
        assert_eq!(pm.mode(), Some(PitmasterMode::Auto));

        pm.apply_field("typ", json!("turbo"));
        assert_eq!(pm.mode(), None);
        assert_eq!(pm.extra.get("typ"), Some(&json!("turbo")));

        assert_eq!("manual".parse::<PitmasterMode>(), Ok(PitmasterMode::Manual));
        assert!("Manual".parse::<PitmasterMode>().is_err());
    }

    #[test]
    fn report_interval_accepts_numbers_and_strings() {
        let mut state = DeviceState::default();
        assert_eq!(state.report_interval(), None);

        state.iot = Some(json!({"PMQint": 30}));
        assert_eq!(state.report_interval(), Some(30));

        state.iot = Some(json!({"PMQint": "45"}));
        assert_eq!(state.report_interval(), Some(45));

        state.iot = Some(json!({"PMQint": 0}));
        assert_eq!(state.report_interval(), None);

        state.iot = Some(json!({"PMQint": "soon"}));
        assert_eq!(state.report_interval(), None);

        state.iot = Some(json!({"PMQint": -5}));
        assert_eq!(state.report_interval(), None);
    }

    #[test]
    fn integers_stay_integers() {
        let mut pm = PitmasterState::default();
        pm.merge_object(object(json!({"set": 110, "value": 0})));
        assert_eq!(pm.setpoint(), Some(110.0));
        assert_eq!(pm.output(), Some(0.0));
        assert_eq!(
            serde_json::to_string(&pm).unwrap(),
            r#"{"set":110,"value":0}"#
        );

        let mut system = SystemState::default();
        system.merge_object(object(json!({"soc": 87, "rssi": -61, "cpu": 12.5})));
        assert_eq!(system.battery_level(), Some(87.0));
        assert_eq!(system.signal_strength(), Some(-61.0));
        assert_eq!(
            serde_json::to_value(&system).unwrap(),
            json!({"soc": 87, "rssi": -61, "cpu": 12.5})
        );
    }

    #[test]
    fn received_empty_arrays_are_kept() {
        let mut document = PitmasterDocument::default();
        assert!(document.controllers().is_empty());
        assert_eq!(serde_json::to_value(&document).unwrap(), json!({}));

        document.apply_field("pm", json!([]));
        assert!(document.controllers().is_empty());
        assert_eq!(serde_json::to_value(&document).unwrap(), json!({"pm": []}));

        let state = DeviceState {
            channel: Some(Vec::new()),
            ..DeviceState::default()
        };
        assert!(!state.is_empty());
        assert_eq!(state.to_json(), json!({"channel": []}));
        assert_eq!(DeviceState::default().to_json(), json!({}));
    }

    #[test]
    fn field_path_display() {
        assert_eq!(FieldPath::channel(2, "min").to_string(), "channel[2].min");
        assert_eq!(
            FieldPath::pitmaster(0, "typ").to_string(),
            "pitmaster.pm[0].typ"
        );
        assert_eq!(FieldPath::system("online").to_string(), "system.online");
    }

    impl ChannelState {
        fn to_json_for_test(&self) -> Value {
            serde_json::to_value(self).unwrap()
        }
    }
}
