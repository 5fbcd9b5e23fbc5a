use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;
use tracing::debug;

use crate::error::{BridgeError, StateError};
use crate::state::{json_type, FragmentKind, StateAggregator};
use crate::topics::TopicLayout;

const PREVIEW_LEN: usize = 48;

/// A message as received from the broker
#[derive(Clone, PartialEq, Eq)]
pub struct MQTTMessage {
    topic: String,
    content: Vec<u8>,
    timestamp: DateTime<Utc>,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let content = String::from_utf8_lossy(&self.content);
        let preview: String = content.chars().take(PREVIEW_LEN).collect();
        write!(f, "{} {} - {}", self.timestamp, self.topic, preview)
    }
}

impl fmt::Debug for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MQTTMessage({})", self)
    }
}

impl MQTTMessage {
    pub fn from_topic(topic: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        MQTTMessage {
            topic: topic.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn from_publish(publish: &rumqttc::Publish) -> Self {
        Self::from_topic(publish.topic.clone(), publish.payload.to_vec())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Parses the payload as a JSON object
    pub fn decode(&self) -> Result<Map<String, Value>, BridgeError> {
        let value: Value =
            serde_json::from_slice(&self.content).map_err(|source| BridgeError::Decode {
                topic: self.topic.clone(),
                source,
            })?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(StateError::NotAnObject(json_type(&other)).into()),
        }
    }
}

/// Routes one inbound message into the aggregator
///
/// Returns the fragment kind that was merged, `Ok(None)` for topics that are
/// not status topics of this device, and an error for payloads that could
/// not be decoded. Rejected payloads never reach the aggregator.
pub fn ingest(
    aggregator: &mut StateAggregator,
    topics: &TopicLayout,
    message: &MQTTMessage,
) -> Result<Option<FragmentKind>, BridgeError> {
    let Some(kind) = topics.classify(message.topic()) else {
        debug!("Ignoring message on unrelated topic {}", message.topic());
        return Ok(None);
    };

    let fragment = message.decode()?;
    aggregator.merge_at(kind, fragment, message.timestamp());
    Ok(Some(kind))
}
