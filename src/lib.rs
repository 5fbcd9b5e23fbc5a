//! MQTT bridge for WLANThermo devices
//!
//! Merges the device's partial status pushes into one device document,
//! derives online/offline from traffic, and encodes control commands.

pub mod command;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod state;
pub mod topics;

pub use command::{Command, CommandBuilder, Outbound, PitmasterContract};
pub use config::BridgeConfig;
pub use error::{BridgeError, CommandError, ConfigError, StateError};
pub use state::{DeviceState, FieldPath, FragmentKind, StateAggregator};
