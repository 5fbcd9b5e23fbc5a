//! # Command Builder
//!
//! Turns a control intent into the MQTT message the device expects, plus the
//! local mutations that make the change visible before the device confirms it
//! with its next status push.
//!
//! ## Wire Contract
//!
//! ```text
//! <prefix>/set/channels   {"number": <channel index + 1>, <field>: <value>}
//! <prefix>/set/pitmaster  {"id": <pitmaster index + 1>, <field>: <value>}
//! <prefix>/set            {"get": "all"}
//! ```
//!
//! Pitmaster payloads follow a [`PitmasterContract`]. Firmware releases
//! disagreed on the shape; the default is the minimal partial object with a
//! 1-based id and no array wrapping. `FullObject` sends the stored pitmaster
//! object with the change applied, for firmware that ignores partial updates.
//!
//! Temperatures and percentages are truncated to integers before encoding.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::CommandError;
use crate::state::{DeviceState, FieldPath, PitmasterMode};
use crate::topics::TopicLayout;

/// Payload shape for `set/pitmaster`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PitmasterContract {
    /// `{"id": n, <field>: <value>}`
    #[default]
    #[serde(rename = "minimal")]
    Minimal,
    /// The stored pitmaster object with `id` set and the change applied
    #[serde(rename = "full")]
    FullObject,
}

/// A control intent addressed by 0-based channel / pitmaster index
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetChannelMin { channel: usize, value: f64 },
    SetChannelMax { channel: usize, value: f64 },
    RenameChannel { channel: usize, name: String },
    SetChannelAlarm { channel: usize, enabled: bool },
    SetChannelEnabled { channel: usize, enabled: bool },
    SetPitmasterMode { pitmaster: usize, mode: PitmasterMode },
    /// `channel` is the 1-based channel number the controller reads from
    SetPitmasterChannel { pitmaster: usize, channel: u32 },
    SetPitmasterProfile { pitmaster: usize, profile: u32 },
    SetPitmasterSetpoint { pitmaster: usize, value: f64 },
    SetPitmasterValue { pitmaster: usize, value: f64 },
    /// Ask the device to push its complete state
    RequestFullState,
}

/// A message ready to publish and the optimistic writes that go with it
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub topic: String,
    pub payload: Value,
    pub optimistic: Vec<(FieldPath, Value)>,
}

impl Outbound {
    pub fn payload_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.payload)
    }
}

/// Encodes commands for one device
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    topics: TopicLayout,
    contract: PitmasterContract,
}

impl CommandBuilder {
    pub fn new(topics: TopicLayout, contract: PitmasterContract) -> Self {
        Self { topics, contract }
    }

    pub fn contract(&self) -> PitmasterContract {
        self.contract
    }

    /// Builds the outbound message for `command` against the current state
    ///
    /// The state is only consulted by the full-object pitmaster contract.
    pub fn build(&self, command: &Command, state: &DeviceState) -> Result<Outbound, CommandError> {
        debug!("Building {:?} with {:?} contract", command, self.contract);

        match command {
            Command::SetChannelMin { channel, value } => {
                let min = device_int("min", *value)?;
                Ok(self.channel_update(*channel, "min", json!(min)))
            }
            Command::SetChannelMax { channel, value } => {
                let max = device_int("max", *value)?;
                Ok(self.channel_update(*channel, "max", json!(max)))
            }
            Command::RenameChannel { channel, name } => {
                Ok(self.channel_update(*channel, "name", json!(name)))
            }
            Command::SetChannelAlarm { channel, enabled } => {
                Ok(self.channel_update(*channel, "alarm", json!(enabled)))
            }
            Command::SetChannelEnabled { channel, enabled } => {
                Ok(self.channel_update(*channel, "enabled", json!(enabled)))
            }
            Command::SetPitmasterMode { pitmaster, mode } => {
                self.pitmaster_update(*pitmaster, "typ", json!(mode.as_str()), state)
            }
            Command::SetPitmasterChannel { pitmaster, channel } => {
                if *channel == 0 {
                    return Err(CommandError::InvalidChannelNumber);
                }
                self.pitmaster_update(*pitmaster, "channel", json!(channel), state)
            }
            Command::SetPitmasterProfile { pitmaster, profile } => {
                self.pitmaster_update(*pitmaster, "pid", json!(profile), state)
            }
            Command::SetPitmasterSetpoint { pitmaster, value } => {
                let set = device_int("set", *value)?;
                self.pitmaster_update(*pitmaster, "set", json!(set), state)
            }
            Command::SetPitmasterValue { pitmaster, value } => {
                let output = device_int("value", *value)?;
                self.pitmaster_update(*pitmaster, "value", json!(output), state)
            }
            Command::RequestFullState => Ok(Outbound {
                topic: self.topics.set(),
                payload: json!({"get": "all"}),
                optimistic: Vec::new(),
            }),
        }
    }

    fn channel_update(&self, index: usize, field: &str, value: Value) -> Outbound {
        let mut payload = Map::new();
        payload.insert("number".to_string(), json!(index + 1));
        payload.insert(field.to_string(), value.clone());

        Outbound {
            topic: self.topics.set_channels(),
            payload: Value::Object(payload),
            optimistic: vec![(FieldPath::channel(index, field), value)],
        }
    }

    fn pitmaster_update(
        &self,
        index: usize,
        field: &str,
        value: Value,
        state: &DeviceState,
    ) -> Result<Outbound, CommandError> {
        let mut payload = Map::new();
        payload.insert("id".to_string(), json!(index + 1));

        if self.contract == PitmasterContract::FullObject {
            let current = state
                .pitmaster(index)
                .ok_or(CommandError::UnknownPitmaster(index))?;
            if let Ok(Value::Object(fields)) = serde_json::to_value(current) {
                for (key, stored) in fields {
                    match key.as_str() {
                        "id" => {}
                        "set" | "value" => {
                            payload.insert(key, device_number(stored));
                        }
                        _ => {
                            payload.insert(key, stored);
                        }
                    }
                }
            }
        }
        payload.insert(field.to_string(), value.clone());

        Ok(Outbound {
            topic: self.topics.set_pitmaster(),
            payload: Value::Object(payload),
            optimistic: vec![(FieldPath::pitmaster(index, field), value)],
        })
    }
}

/// Truncates toward zero; the device protocol only carries integers here
fn device_int(field: &'static str, value: f64) -> Result<i64, CommandError> {
    if !value.is_finite() {
        return Err(CommandError::NonFiniteValue { field, value });
    }
    Ok(value.trunc() as i64)
}

/// Truncates a stored fractional number so it can be sent back to the device
fn device_number(stored: Value) -> Value {
    match &stored {
        Value::Number(n) if !n.is_i64() && !n.is_u64() => match n.as_f64() {
            Some(f) if f.is_finite() => json!(f.trunc() as i64),
            _ => stored,
        },
        _ => stored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FragmentKind, StateAggregator};
    use pretty_assertions::assert_eq;

    fn builder(contract: PitmasterContract) -> CommandBuilder {
        CommandBuilder::new(TopicLayout::new("WLanThermo/MINI-V3"), contract)
    }

    fn state_with_pitmaster() -> DeviceState {
        let mut aggregator = StateAggregator::new();
        let fragment = json!({
            "channel": [{"temp": 20}, {"temp": 21}, {"temp": 22}],
            "pitmaster": {"pm": [{"id": 0, "channel": 1, "pid": 0, "value": 0, "set": 110, "typ": "off"}]}
        });
        aggregator.merge_value(FragmentKind::Data, fragment).unwrap();
        aggregator.snapshot()
    }

    #[test]
    fn alarm_min_payload_is_exact() {
        let outbound = builder(PitmasterContract::Minimal)
            .build(
                &Command::SetChannelMin {
                    channel: 2,
                    value: 10.0,
                },
                &DeviceState::default(),
            )
            .unwrap();

        assert_eq!(outbound.topic, "WLanThermo/MINI-V3/set/channels");
        assert_eq!(
            String::from_utf8(outbound.payload_bytes().unwrap()).unwrap(),
            r#"{"number":3,"min":10}"#
        );
        assert_eq!(
            outbound.optimistic,
            vec![(FieldPath::channel(2, "min"), json!(10))]
        );
    }

    #[test]
    fn pitmaster_mode_payload_is_exact() {
        let outbound = builder(PitmasterContract::Minimal)
            .build(
                &Command::SetPitmasterMode {
                    pitmaster: 0,
                    mode: PitmasterMode::Auto,
                },
                &DeviceState::default(),
            )
            .unwrap();

        assert_eq!(outbound.topic, "WLanThermo/MINI-V3/set/pitmaster");
        assert_eq!(
            String::from_utf8(outbound.payload_bytes().unwrap()).unwrap(),
            r#"{"id":1,"typ":"auto"}"#
        );
        assert_eq!(
            outbound.optimistic,
            vec![(FieldPath::pitmaster(0, "typ"), json!("auto"))]
        );
    }

    #[test]
    fn channel_commands() {
        let b = builder(PitmasterContract::Minimal);
        let state = DeviceState::default();

        let max = b
            .build(&Command::SetChannelMax { channel: 0, value: 95.7 }, &state)
            .unwrap();
        assert_eq!(max.payload, json!({"number": 1, "max": 95}));

        let rename = b
            .build(
                &Command::RenameChannel {
                    channel: 1,
                    name: "Brisket".to_string(),
                },
                &state,
            )
            .unwrap();
        assert_eq!(rename.payload, json!({"number": 2, "name": "Brisket"}));
        assert_eq!(
            rename.optimistic,
            vec![(FieldPath::channel(1, "name"), json!("Brisket"))]
        );

        let alarm = b
            .build(&Command::SetChannelAlarm { channel: 3, enabled: true }, &state)
            .unwrap();
        assert_eq!(alarm.payload, json!({"number": 4, "alarm": true}));

        let enabled = b
            .build(&Command::SetChannelEnabled { channel: 0, enabled: false }, &state)
            .unwrap();
        assert_eq!(enabled.payload, json!({"number": 1, "enabled": false}));
        assert_eq!(enabled.topic, "WLanThermo/MINI-V3/set/channels");
    }

    #[test]
    fn pitmaster_commands() {
        let b = builder(PitmasterContract::Minimal);
        let state = DeviceState::default();

        let channel = b
            .build(&Command::SetPitmasterChannel { pitmaster: 0, channel: 3 }, &state)
            .unwrap();
        assert_eq!(channel.payload, json!({"id": 1, "channel": 3}));

        let profile = b
            .build(&Command::SetPitmasterProfile { pitmaster: 1, profile: 2 }, &state)
            .unwrap();
        assert_eq!(profile.payload, json!({"id": 2, "pid": 2}));

        let setpoint = b
            .build(&Command::SetPitmasterSetpoint { pitmaster: 0, value: 107.9 }, &state)
            .unwrap();
        assert_eq!(setpoint.payload, json!({"id": 1, "set": 107}));

        let value = b
            .build(&Command::SetPitmasterValue { pitmaster: 0, value: 42.5 }, &state)
            .unwrap();
        assert_eq!(value.payload, json!({"id": 1, "value": 42}));
        assert_eq!(
            value.optimistic,
            vec![(FieldPath::pitmaster(0, "value"), json!(42))]
        );
    }

    #[test]
    fn values_truncate_toward_zero() {
        assert_eq!(device_int("min", 10.99), Ok(10));
        assert_eq!(device_int("min", -3.7), Ok(-3));
        assert!(matches!(
            device_int("set", f64::NAN),
            Err(CommandError::NonFiniteValue { field: "set", .. })
        ));
    }

    #[test]
    fn rejects_invalid_input() {
        let b = builder(PitmasterContract::Minimal);
        let state = DeviceState::default();

        assert_eq!(
            b.build(&Command::SetPitmasterChannel { pitmaster: 0, channel: 0 }, &state),
            Err(CommandError::InvalidChannelNumber)
        );
        assert!(matches!(
            b.build(
                &Command::SetChannelMin {
                    channel: 0,
                    value: f64::INFINITY
                },
                &state
            ),
            Err(CommandError::NonFiniteValue { field: "min", .. })
        ));
    }

    #[test]
    fn full_state_request() {
        let outbound = builder(PitmasterContract::Minimal)
            .build(&Command::RequestFullState, &DeviceState::default())
            .unwrap();
        assert_eq!(outbound.topic, "WLanThermo/MINI-V3/set");
        assert_eq!(outbound.payload, json!({"get": "all"}));
        assert!(outbound.optimistic.is_empty());
    }

    #[test]
    fn full_object_contract_overlays_stored_pitmaster() {
        let b = builder(PitmasterContract::FullObject);
        let state = state_with_pitmaster();

        let outbound = b
            .build(
                &Command::SetPitmasterMode {
                    pitmaster: 0,
                    mode: PitmasterMode::Manual,
                },
                &state,
            )
            .unwrap();

        assert_eq!(
            outbound.payload,
            json!({"id": 1, "typ": "manual", "channel": 1, "pid": 0, "set": 110, "value": 0})
        );
        assert_eq!(
            b.build(
                &Command::SetPitmasterMode {
                    pitmaster: 1,
                    mode: PitmasterMode::Off
                },
                &state
            ),
            Err(CommandError::UnknownPitmaster(1))
        );
    }

    #[test]
    fn full_object_contract_sends_integers() {
        let b = builder(PitmasterContract::FullObject);
        let state = state_with_pitmaster();

        let outbound = b
            .build(&Command::SetPitmasterSetpoint { pitmaster: 0, value: 120.0 }, &state)
            .unwrap();
        assert_eq!(
            String::from_utf8(outbound.payload_bytes().unwrap()).unwrap(),
            r#"{"id":1,"typ":"off","channel":1,"pid":0,"set":120,"value":0}"#
        );

        let mut aggregator = StateAggregator::new();
        aggregator
            .merge_value(
                FragmentKind::Data,
                json!({"pitmaster": {"pm": [{"typ": "auto", "set": 107.6, "value": 33.3}]}}),
            )
            .unwrap();
        let outbound = b
            .build(
                &Command::SetPitmasterMode {
                    pitmaster: 0,
                    mode: PitmasterMode::Manual,
                },
                aggregator.state(),
            )
            .unwrap();
        assert_eq!(
            outbound.payload,
            json!({"id": 1, "typ": "manual", "set": 107, "value": 33})
        );
    }

    #[test]
    fn channel_commands_ignore_contract() {
        let minimal = builder(PitmasterContract::Minimal);
        let full = builder(PitmasterContract::FullObject);
        let state = state_with_pitmaster();
        let command = Command::SetChannelMin {
            channel: 1,
            value: 12.0,
        };
        assert_eq!(
            minimal.build(&command, &state).unwrap(),
            full.build(&command, &state).unwrap()
        );
    }

    #[test]
    fn contract_names_in_config() {
        #[derive(Deserialize)]
        struct Wrapper {
            contract: PitmasterContract,
        }
        let parsed: Wrapper = toml::from_str("contract = \"full\"").unwrap();
        assert_eq!(parsed.contract, PitmasterContract::FullObject);
        let parsed: Wrapper = toml::from_str("contract = \"minimal\"").unwrap();
        assert_eq!(parsed.contract, PitmasterContract::Minimal);
    }
}
