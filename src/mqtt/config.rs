use std::time::Duration;

use rumqttc::MqttOptions;
use serde::{Deserialize, Serialize};

/// Broker connection settings
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            user: None,
            password: None,
            client_id: "thermobridge".to_string(),
            keep_alive_secs: 5,
        }
    }
}

impl MqttConfig {
    pub fn to_options(&self) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        mqtt_options.set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(1)));
        if let Some(user) = &self.user {
            mqtt_options.set_credentials(user.clone(), self.password.clone().unwrap_or_default());
        }
        mqtt_options
    }
}
