//! Read-only device metadata derived from the merged state

use serde::Serialize;

use super::DeviceState;

pub const MANUFACTURER: &str = "WLANThermo";

/// Model reported until the device tells us its hardware version
pub const DEFAULT_MODEL: &str = "WLANThermo Device";

/// Identity of the device as shown to a host platform
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    /// Stable identifier, the MQTT topic prefix
    pub identifier: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: Option<String>,
    /// Web UI of the device, when its IP address is known
    pub configuration_url: Option<String>,
}

impl DeviceInfo {
    pub fn from_state(name: &str, topic_prefix: &str, state: &DeviceState) -> Self {
        let system = state.system.as_ref();

        Self {
            identifier: topic_prefix.to_string(),
            name: name.to_string(),
            manufacturer: MANUFACTURER.to_string(),
            model: system
                .and_then(|s| s.hw_version.clone())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            sw_version: system.and_then(|s| s.sw_version.clone()),
            configuration_url: system
                .and_then(|s| s.ip.as_deref())
                .filter(|ip| !ip.is_empty())
                .map(|ip| format!("http://{}", ip)),
        }
    }
}
