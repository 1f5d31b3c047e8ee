//! Configuration for the sensor bridge.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use fieldlink_bridge_framework::{BridgeArgs, BridgeConfig, BridgeError, BrokerConfig, LoggingConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::locator::{
    MESH_ROLE, MatchRule, RoleSelector, SENSOR_ROLE, default_mesh_rules, default_sensor_rules,
};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorBridgeConfig {
    /// Broker session settings
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Bridge behaviour
    #[serde(default)]
    pub bridge: BridgeSettings,

    /// Activity journal
    #[serde(default)]
    pub journal: JournalConfig,
}

/// Timers, topic and device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Broker topic (default: "wio/environmental_station/data")
    pub topic: String,

    /// Minimum time between two accepted blocks
    pub storage_interval_secs: u64,

    /// Mesh dispatch period
    pub mesh_interval_secs: u64,

    /// Broker dispatch period
    pub broker_interval_secs: u64,

    /// Upper bound on a single broker publish
    pub publish_timeout_secs: u64,

    /// How often broker connectivity is sampled
    pub link_check_interval_secs: u64,

    /// Minimum time between two raw block echoes at debug level
    pub raw_echo_interval_secs: u64,

    pub sensor: SensorSettings,
    pub mesh: MeshSettings,
    pub reconnect: ReconnectSettings,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            topic: "wio/environmental_station/data".to_string(),
            storage_interval_secs: 60,
            mesh_interval_secs: 300,
            broker_interval_secs: 150,
            publish_timeout_secs: 5,
            link_check_interval_secs: 5,
            raw_echo_interval_secs: 60,
            sensor: SensorSettings::default(),
            mesh: MeshSettings::default(),
            reconnect: ReconnectSettings::default(),
        }
    }
}

/// Ordered port-matching rules for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub rules: Vec<MatchRule>,
}

/// Sensor terminal link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Explicit device path; discovery is used when unset
    pub port: Option<String>,
    pub baud_rate: u32,
    pub selector: SelectorConfig,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            selector: SelectorConfig {
                rules: default_sensor_rules(),
            },
        }
    }
}

/// Mesh radio link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    /// Explicit device path; discovery is used when unset
    pub port: Option<String>,
    pub baud_rate: u32,

    /// Channel index messages are broadcast on (0-7)
    pub channel_index: u32,

    pub hop_limit: u32,

    /// Pause between two messages of one batch
    pub message_gap_ms: u64,

    /// Upper bound on writing a single frame
    pub write_timeout_ms: u64,

    /// Label overrides, keyed by sensor key
    pub labels: HashMap<String, String>,

    pub selector: SelectorConfig,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            channel_index: 1,
            hop_limit: 3,
            message_gap_ms: 500,
            write_timeout_ms: 2000,
            labels: HashMap::new(),
            selector: SelectorConfig {
                rules: default_mesh_rules(),
            },
        }
    }
}

/// Sensor reattachment policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub delay_secs: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            delay_secs: 5,
            max_attempts: 3,
        }
    }
}

/// Activity journal location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub file_prefix: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("logs"),
            file_prefix: "fieldlink_bridge_log".to_string(),
        }
    }
}

impl SensorBridgeConfig {
    /// Parse a JSON5 document without validating it.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(json5::from_str(content)?)
    }

    /// Bridge-specific checks on top of the common ones.
    pub fn check(&self) -> Result<(), ConfigError> {
        let b = &self.bridge;
        for (name, value) in [
            ("storage_interval_secs", b.storage_interval_secs),
            ("mesh_interval_secs", b.mesh_interval_secs),
            ("broker_interval_secs", b.broker_interval_secs),
            ("publish_timeout_secs", b.publish_timeout_secs),
            ("link_check_interval_secs", b.link_check_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{} must be non-zero", name)));
            }
        }

        if b.mesh.channel_index >= 8 {
            return Err(ConfigError::Validation(format!(
                "mesh.channel_index must be 0-7, got {}",
                b.mesh.channel_index
            )));
        }
        if b.mesh.write_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "mesh.write_timeout_ms must be non-zero".to_string(),
            ));
        }
        if b.reconnect.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "reconnect.max_attempts must be at least 1".to_string(),
            ));
        }

        for (role, selector) in [
            (SENSOR_ROLE, self.sensor_selector()),
            (MESH_ROLE, self.mesh_selector()),
        ] {
            if !selector.is_usable() {
                return Err(ConfigError::Validation(format!(
                    "{}: selector needs at least one non-empty rule",
                    role
                )));
            }
        }

        if self.journal.enabled && self.journal.file_prefix.trim().is_empty() {
            return Err(ConfigError::Validation(
                "journal.file_prefix must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Apply `--port ROLE=PATH` overrides. Returns the roles that were not
    /// recognised.
    pub fn apply_port_overrides(&mut self, args: &BridgeArgs) -> Vec<String> {
        let mut unknown = Vec::new();
        for port in &args.ports {
            match port.role.as_str() {
                SENSOR_ROLE => self.bridge.sensor.port = Some(port.path.clone()),
                MESH_ROLE => self.bridge.mesh.port = Some(port.path.clone()),
                other => {
                    tracing::warn!(role = %other, path = %port.path, "Ignoring port override for unknown role");
                    unknown.push(other.to_string());
                }
            }
        }
        unknown
    }

    pub fn sensor_selector(&self) -> RoleSelector {
        RoleSelector::new(SENSOR_ROLE, self.bridge.sensor.selector.rules.clone())
    }

    pub fn mesh_selector(&self) -> RoleSelector {
        RoleSelector::new(MESH_ROLE, self.bridge.mesh.selector.rules.clone())
    }

    pub fn storage_interval(&self) -> Duration {
        Duration::from_secs(self.bridge.storage_interval_secs)
    }

    pub fn mesh_interval(&self) -> Duration {
        Duration::from_secs(self.bridge.mesh_interval_secs)
    }

    pub fn broker_interval(&self) -> Duration {
        Duration::from_secs(self.bridge.broker_interval_secs)
    }

    pub fn raw_echo_interval(&self) -> Duration {
        Duration::from_secs(self.bridge.raw_echo_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.bridge.reconnect.delay_secs)
    }

    pub fn message_gap(&self) -> Duration {
        Duration::from_millis(self.bridge.mesh.message_gap_ms)
    }

    pub fn mesh_write_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge.mesh.write_timeout_ms)
    }
}

impl BridgeConfig for SensorBridgeConfig {
    fn broker(&self) -> &BrokerConfig {
        &self.broker
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn topic(&self) -> &str {
        &self.bridge.topic
    }

    fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge.publish_timeout_secs)
    }

    fn link_check_interval(&self) -> Duration {
        Duration::from_secs(self.bridge.link_check_interval_secs)
    }

    fn validate(&self) -> Result<(), BridgeError> {
        if self.bridge.topic.trim().is_empty() {
            return Err(BridgeError::validation("topic must not be empty"));
        }
        self.broker
            .validate()
            .map_err(|e| BridgeError::validation(e.to_string()))?;
        self.check()
            .map_err(|e| BridgeError::validation(e.to_string()))
    }
}
