//! Topic layout below the device's configured prefix

use crate::state::FragmentKind;

pub const STATUS_DATA: &str = "status/data";
pub const STATUS_SETTINGS: &str = "status/settings";
pub const SET_CHANNELS: &str = "set/channels";
pub const SET_PITMASTER: &str = "set/pitmaster";
pub const SET: &str = "set";

/// Fully qualified topics for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    prefix: String,
}

impl TopicLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn join(&self, suffix: &str) -> String {
        format!("{}/{}", self.prefix, suffix)
    }

    pub fn status_data(&self) -> String {
        self.join(STATUS_DATA)
    }

    pub fn status_settings(&self) -> String {
        self.join(STATUS_SETTINGS)
    }

    pub fn set_channels(&self) -> String {
        self.join(SET_CHANNELS)
    }

    pub fn set_pitmaster(&self) -> String {
        self.join(SET_PITMASTER)
    }

    pub fn set(&self) -> String {
        self.join(SET)
    }

    /// Topics the bridge subscribes to, with the fragment kind each one carries
    pub fn inbound(&self) -> [(String, FragmentKind); 2] {
        [
            (self.status_data(), FragmentKind::Data),
            (self.status_settings(), FragmentKind::Settings),
        ]
    }

    /// Fragment kind for an inbound topic, `None` for anything else
    pub fn classify(&self, topic: &str) -> Option<FragmentKind> {
        let suffix = topic.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        match suffix {
            STATUS_DATA => Some(FragmentKind::Data),
            STATUS_SETTINGS => Some(FragmentKind::Settings),
            _ => None,
        }
    }
}
