//! Configuration traits and utilities.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::{BridgeError, Result};
use crate::{BrokerConfig, LoggingConfig};

/// Trait for bridge configuration types.
///
/// Implement this trait for your bridge's configuration struct to get
/// automatic loading, validation, and access to common config fields.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use fieldlink_bridge_framework::{BridgeConfig, BrokerConfig, LoggingConfig};
///
/// #[derive(Debug, Default, Deserialize)]
/// pub struct MyBridgeConfig {
///     #[serde(default)]
///     pub broker: BrokerConfig,
///     #[serde(default)]
///     pub logging: LoggingConfig,
///     pub topic: String,
/// }
///
/// impl BridgeConfig for MyBridgeConfig {
///     fn broker(&self) -> &BrokerConfig {
///         &self.broker
///     }
///
///     fn logging(&self) -> &LoggingConfig {
///         &self.logging
///     }
///
///     fn topic(&self) -> &str {
///         &self.topic
///     }
/// }
/// ```
pub trait BridgeConfig: Sized + DeserializeOwned {
    /// Get the broker session configuration.
    fn broker(&self) -> &BrokerConfig;

    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Get the topic this bridge publishes to.
    fn topic(&self) -> &str;

    /// Upper bound on a single publish.
    fn publish_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// How often broker connectivity is sampled.
    fn link_check_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Validate the configuration.
    ///
    /// Called automatically after loading. Override to add custom validation.
    fn validate(&self) -> Result<()> {
        if self.topic().trim().is_empty() {
            return Err(BridgeError::validation("topic must not be empty"));
        }
        self.broker()
            .validate()
            .map_err(|e| BridgeError::validation(e.to_string()))
    }

    /// Load configuration from a file path.
    ///
    /// Supports JSON5 format. Calls [`validate`](Self::validate) after loading.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BridgeError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&content)?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is missing.
    ///
    /// Used for the built-in default path; a user-supplied path should go
    /// through [`load`](Self::load) so a typo is reported.
    fn load_or_default(path: impl AsRef<Path>) -> Result<Self>
    where
        Self: Default,
    {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        Self::load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        #[serde(default)]
        broker: BrokerConfig,
        #[serde(default)]
        logging: LoggingConfig,
        #[serde(default = "default_topic")]
        topic: String,
    }

    fn default_topic() -> String {
        "station/data".to_string()
    }

    impl Default for TestConfig {
        fn default() -> Self {
            Self {
                broker: BrokerConfig::default(),
                logging: LoggingConfig::default(),
                topic: default_topic(),
            }
        }
    }

    impl BridgeConfig for TestConfig {
        fn broker(&self) -> &BrokerConfig {
            &self.broker
        }

        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }

        fn topic(&self) -> &str {
            &self.topic
        }
    }

    #[test]
    fn test_config_not_found() {
        let result = TestConfig::load("/nonexistent/path.json5");
        assert!(matches!(result, Err(BridgeError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = TestConfig::load_or_default("/nonexistent/path.json5").unwrap();
        assert_eq!(config.topic, "station/data");
        assert_eq!(config.broker.mode, "client");
    }

    #[test]
    fn test_load_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ topic: "  " }}"#).unwrap();
        let result = TestConfig::load(file.path());
        assert!(matches!(result, Err(BridgeError::ConfigValidation(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ broker: {{ mode: "mesh" }} }}"#).unwrap();
        let result = TestConfig::load(file.path());
        assert!(matches!(result, Err(BridgeError::ConfigValidation(_))));
    }

    #[test]
    fn test_load_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{ topic: ").unwrap();
        let result = TestConfig::load(file.path());
        assert!(matches!(result, Err(BridgeError::ConfigParse(_))));
    }
}
