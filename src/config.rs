//! Bridge configuration
//!
//! Read from `config.toml` in the user's config directory
//! (`~/.config/thermobridge/config.toml` on Linux) or from the path in
//! `THERMOBRIDGE_CONFIG`. A missing file is not an error: every field has a
//! default so the bridge starts against a local broker with the stock topic
//! prefix.
//!
//! ```toml
//! device_name = "Grill"
//! topic_prefix = "WLanThermo/MINI-V3"
//! pitmaster_contract = "minimal"
//!
//! [mqtt]
//! host = "192.168.178.10"
//! port = 1883
//! user = "bridge"
//! password = "secret"
//!
//! [liveness]
//! check_interval_secs = 30
//!
//! [startup]
//! request_full_state = true
//! first_data_timeout_secs = 10
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::command::PitmasterContract;
use crate::error::ConfigError;
use crate::mqtt::config::MqttConfig;

pub const DEFAULT_NAME: &str = "WLANThermo";
pub const DEFAULT_TOPIC_PREFIX: &str = "WLanThermo/MINI-V3";
pub const CONFIG_ENV: &str = "THERMOBRIDGE_CONFIG";

const CONFIG_DIR: &str = "thermobridge";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Display name of the device
    pub device_name: String,
    /// Topic prefix configured on the device, without trailing slash
    pub topic_prefix: String,
    pub pitmaster_contract: PitmasterContract,
    pub mqtt: MqttConfig,
    pub liveness: LivenessConfig,
    pub startup: StartupConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_NAME.to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            pitmaster_contract: PitmasterContract::default(),
            mqtt: MqttConfig::default(),
            liveness: LivenessConfig::default(),
            startup: StartupConfig::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LivenessConfig {
    /// Period of the offline check
    pub check_interval_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: crate::state::liveness::CHECK_INTERVAL.as_secs(),
        }
    }
}

impl LivenessConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StartupConfig {
    /// Publish `{"get":"all"}` once the subscriptions are in place
    pub request_full_state: bool,
    /// How long the host waits for the first fragment before carrying on
    pub first_data_timeout_secs: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            request_full_state: true,
            first_data_timeout_secs: 10,
        }
    }
}

impl StartupConfig {
    pub fn first_data_timeout(&self) -> Duration {
        Duration::from_secs(self.first_data_timeout_secs)
    }
}

impl BridgeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// `$THERMOBRIDGE_CONFIG`, else `<config dir>/thermobridge/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|mut path| {
            path.push(CONFIG_DIR);
            path.push(CONFIG_FILE);
            path
        })
    }

    /// Loads the file at `path`, falling back to defaults when it does not exist
    pub async fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        if !exists {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Loaded config from {}", path.display());
        Self::from_toml_str(&content)
    }

    /// Loads from [`BridgeConfig::default_path`], or defaults when there is none
    pub async fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load_or_default(&path).await,
            None => {
                info!("No config directory available, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = self.topic_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return Err(ConfigError::Invalid("topic_prefix must not be empty".into()));
        }
        if prefix.contains(['+', '#']) {
            return Err(ConfigError::Invalid(format!(
                "topic_prefix must not contain wildcards: {}",
                self.topic_prefix
            )));
        }
        if self.liveness.check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "liveness.check_interval_secs must be positive".into(),
            ));
        }
        if self.mqtt.host.is_empty() {
            return Err(ConfigError::Invalid("mqtt.host must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_file_yields_defaults() {
        let config = BridgeConfig::from_toml_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.topic_prefix, "WLanThermo/MINI-V3");
        assert_eq!(config.liveness.check_interval(), Duration::from_secs(30));
        assert_eq!(config.startup.first_data_timeout(), Duration::from_secs(10));
        assert!(config.startup.request_full_state);
        assert_eq!(config.pitmaster_contract, PitmasterContract::Minimal);
    }

    #[test]
    fn partial_file_overrides_fields() {
        let config = BridgeConfig::from_toml_str(
            r#"
            device_name = "Smoker"
            topic_prefix = "garden/wlt"
            pitmaster_contract = "full"

            [mqtt]
            host = "10.0.0.2"
            user = "bridge"
            password = "secret"

            [startup]
            request_full_state = false
            "#,
        )
        .unwrap();

        assert_eq!(config.device_name, "Smoker");
        assert_eq!(config.topic_prefix, "garden/wlt");
        assert_eq!(config.pitmaster_contract, PitmasterContract::FullObject);
        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.user.as_deref(), Some("bridge"));
        assert!(!config.startup.request_full_state);
        assert_eq!(config.startup.first_data_timeout_secs, 10);
    }

    #[test]
    fn rejects_unusable_values() {
        assert!(matches!(
            BridgeConfig::from_toml_str("topic_prefix = \"\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            BridgeConfig::from_toml_str("topic_prefix = \"wlt/#\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            BridgeConfig::from_toml_str("[liveness]\ncheck_interval_secs = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            BridgeConfig::from_toml_str("topic_prefix = 5"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("thermobridge-missing-config-for-test.toml");
        let config = BridgeConfig::load_or_default(&path).await.unwrap();
        assert_eq!(config, BridgeConfig::default());
    }
}
