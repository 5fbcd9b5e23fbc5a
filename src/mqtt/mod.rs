//! # MQTT Bridge Module
//!
//! Connects the state core to a broker. One bridge session serves one
//! WLANThermo device: it subscribes to the device's status topics, feeds
//! every fragment into the aggregator, runs the periodic offline check and
//! publishes control commands.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker connection settings
//! ├── message_manager.rs  - Message representation, decode and routing
//! └── mqtt_handler.rs     - Session state machine and owner handle
//! ```
//!
//! ## Design Notes
//!
//! - The aggregator lives behind one async mutex; merges, liveness checks
//!   and optimistic writes each hold it briefly and never across I/O.
//! - Connection handling, retries and QoS belong to rumqttc. Commands are
//!   published at most once; a failure is returned to the caller.
//! - Malformed payloads are logged and dropped before they reach the state.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

pub use mqtt_handler::{BridgeHandle, ConnectionState, MQTTStatus, SharedAggregator};
