//! State aggregator: merges device fragments into one document
//!
//! One aggregator exists per device connection. It is synchronous and holds
//! no locks; a host that touches it from several threads wraps it in a mutex
//! (see `mqtt::mqtt_handler::SharedAggregator`).

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::liveness::{adaptive_timeout, is_expired, LivenessTransition};
use super::{
    json_type, merge_positional, DeviceState, FieldMerge, FieldPath, FragmentKind,
    PitmasterDocument, SystemState,
};
use crate::error::StateError;

/// Callback invoked with the whole document after every change
pub type StateListener = Box<dyn Fn(&DeviceState) + Send + Sync>;

/// Handle returned by [`StateAggregator::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Owner of the canonical device document
#[derive(Default)]
pub struct StateAggregator {
    state: DeviceState,
    listeners: Vec<(ListenerId, StateListener)>,
    next_listener: u64,
}

impl fmt::Debug for StateAggregator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StateAggregator")
            .field("state", &self.state)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl StateAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener; it is called synchronously after each change
    pub fn subscribe(&mut self, listener: StateListener) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, listener));
        debug!("Registered state listener {:?}", id);
        id
    }

    /// Removes a listener, returning whether it was registered
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        before != self.listeners.len()
    }

    /// Read-only view of the current document
    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Copy of the current document
    pub fn snapshot(&self) -> DeviceState {
        self.state.clone()
    }

    /// Merges a fragment received now
    pub fn merge(&mut self, kind: FragmentKind, fragment: Map<String, Value>) {
        self.merge_at(kind, fragment, Utc::now());
    }

    /// Merges an already-decoded value, rejecting anything but an object
    pub fn merge_value(&mut self, kind: FragmentKind, fragment: Value) -> Result<(), StateError> {
        match fragment {
            Value::Object(map) => {
                self.merge(kind, map);
                Ok(())
            }
            other => Err(StateError::NotAnObject(json_type(&other))),
        }
    }

    /// Merges a fragment as if it had arrived at `now`
    ///
    /// Each top-level key is handled by its own rule:
    ///
    /// | key | rule |
    /// |---|---|
    /// | `system` | shallow merge |
    /// | `channel` | positional merge, grow only |
    /// | `pitmaster` | `pm` positional, other keys replaced |
    /// | anything else | replaced |
    ///
    /// On an empty document these rules reproduce the fragment as is.
    pub fn merge_at(&mut self, kind: FragmentKind, fragment: Map<String, Value>, now: DateTime<Utc>) {
        if self.state.is_empty() {
            info!("First {} fragment received, establishing state", kind);
        }
        debug!("Merging {} fragment with {} keys", kind, fragment.len());

        for (key, value) in fragment {
            self.merge_key(&key, value);
        }

        self.state.last_update = Some(now);
        if let Some(system) = self.state.system.as_mut() {
            system.apply_field("online", Value::Bool(true));
        }

        self.notify();
    }

    fn merge_key(&mut self, key: &str, value: Value) {
        match key {
            "system" => match value {
                Value::Object(map) => self
                    .state
                    .system
                    .get_or_insert_with(SystemState::default)
                    .merge_object(map),
                other => warn!("Ignoring 'system' of type {}", json_type(&other)),
            },
            "channel" => match value {
                Value::Array(items) => merge_positional(
                    self.state.channel.get_or_insert_with(Vec::new),
                    items,
                    "channel",
                ),
                other => warn!("Ignoring 'channel' of type {}", json_type(&other)),
            },
            "pitmaster" => match value {
                Value::Object(map) => self
                    .state
                    .pitmaster
                    .get_or_insert_with(PitmasterDocument::default)
                    .merge_object(map),
                other => warn!("Ignoring 'pitmaster' of type {}", json_type(&other)),
            },
            "pid" => self.state.pid = Some(value),
            "sensors" => self.state.sensors = Some(value),
            "iot" => self.state.iot = Some(value),
            _ => {
                self.state.extra.insert(key.to_string(), value);
            }
        }
    }

    /// Marks the device offline when it has been silent for too long
    ///
    /// Only ever writes `online = false`; merges bring it back. Returns the
    /// transition the first time the timeout is exceeded, `None` otherwise.
    pub fn check_liveness(&mut self, now: DateTime<Utc>) -> Option<LivenessTransition> {
        let last_update = self.state.last_update?;
        let timeout = adaptive_timeout(self.state.report_interval());

        if !is_expired(last_update, now, timeout) {
            return None;
        }
        if self.state.is_online() == Some(false) {
            return None;
        }

        self.state
            .system
            .get_or_insert_with(SystemState::default)
            .apply_field("online", Value::Bool(false));

        let transition = LivenessTransition {
            last_update,
            detected_at: now,
            timeout,
        };
        info!("Device marked offline: {}", transition);
        self.notify();
        Some(transition)
    }

    /// Writes one leaf ahead of the device confirming it
    ///
    /// Leaves `last_update` alone and never grows arrays. Returns whether the
    /// write landed.
    pub fn apply_optimistic(&mut self, path: FieldPath, value: Value) -> bool {
        let applied = match &path {
            FieldPath::System { field } => {
                self.state
                    .system
                    .get_or_insert_with(SystemState::default)
                    .apply_field(field, value);
                true
            }
            FieldPath::Channel { index, field } => match self
                .state
                .channel
                .as_mut()
                .and_then(|c| c.get_mut(*index))
            {
                Some(channel) => {
                    channel.apply_field(field, value);
                    true
                }
                None => false,
            },
            FieldPath::Pitmaster { index, field } => match self
                .state
                .pitmaster
                .as_mut()
                .and_then(|p| p.pm.as_mut())
                .and_then(|pm| pm.get_mut(*index))
            {
                Some(pm) => {
                    pm.apply_field(field, value);
                    true
                }
                None => false,
            },
        };

        if applied {
            debug!("Optimistic update applied to {}", path);
            self.notify();
        } else {
            warn!("Optimistic update to {} ignored: index out of range", path);
        }
        applied
    }

    fn notify(&self) {
        for (_, listener) in &self.listeners {
            listener(&self.state);
        }
    }
}
