//! Error definitions for the state core, the command builder and the MQTT bridge

use std::path::PathBuf;

use thiserror::Error;

/// Contract violations when feeding the aggregator
///
/// Shape irregularities inside a fragment are tolerated and never surface here.
#[derive(Debug, Error)]
pub enum StateError {
    /// A merge was attempted with something other than a JSON object
    #[error("fragment must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Errors while turning a control intent into an outbound message
#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    /// Temperatures and percentages must be finite before they are truncated
    #[error("value for '{field}' is not a finite number: {value}")]
    NonFiniteValue { field: &'static str, value: f64 },

    /// Pitmaster channel numbers are 1-based on the wire
    #[error("pitmaster channel numbers start at 1, got 0")]
    InvalidChannelNumber,

    /// The full-object contract needs the stored pitmaster to build a payload
    #[error("no pitmaster at index {0} in the current state")]
    UnknownPitmaster(usize),
}

/// Errors while loading or validating the bridge configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file exists but could not be read
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Parsed values that cannot be used
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors raised by the MQTT bridge runtime
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Inbound payload was not valid JSON; the message is dropped
    #[error("failed to decode payload on '{topic}': {source}")]
    Decode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("command error: {0}")]
    Command(#[from] CommandError),

    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// The transport refused the request; no retry is attempted
    #[error("publish failed: {0}")]
    Publish(#[from] rumqttc::ClientError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The bridge task is gone or stopped answering
    #[error("channel error: {0}")]
    ChannelError(String),
}
