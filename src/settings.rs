//! Loading and validation of the crate settings.
//!
//! Settings come from a TOML file merged with `FEDSUM__`-prefixed
//! environment variables, and are validated before use.

use std::{fmt, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::mask::MaskConfig;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Deserialize, Validate)]
pub struct Settings {
    #[validate]
    pub protocol: ProtocolSettings,
    pub mask: MaskSettings,
    #[validate]
    pub training: TrainingSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the file cannot be loaded or deserialized, or when a
    /// loaded value is invalid.
    pub fn new(path: PathBuf) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: PathBuf) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(File::from(path))?;
        config.merge(Environment::with_prefix("fedsum").separator("__"))?;
        config.try_into()
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Validate)]
/// Transport and negotiation settings.
pub struct ProtocolSettings {
    /// Seconds a party waits for any single expected message.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [protocol]
    /// deadline_secs = 30
    /// ```
    #[validate(range(min = 1))]
    pub deadline_secs: u64,

    /// Maximum number of identity-negotiation attempts.
    #[validate(range(min = 1))]
    pub max_uuid_retries: u32,
}

impl ProtocolSettings {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

/// Masking group settings, mirroring [`MaskConfig`].
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct MaskSettings {
    pub precision: u32,
    pub bound: u32,
    pub max_parties: u32,
}

impl From<MaskSettings> for MaskConfig {
    fn from(settings: MaskSettings) -> Self {
        Self {
            precision: settings.precision,
            bound: settings.bound,
            max_parties: settings.max_parties,
        }
    }
}

/// Settings of the Arbiter round loop.
#[derive(Clone, Copy, Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_training"))]
pub struct TrainingSettings {
    /// Hard cap on the number of aggregation rounds.
    #[validate(range(min = 1))]
    pub max_iterations: u64,

    /// Convergence threshold on the absolute loss delta.
    pub eps: f64,
}

fn validate_training(settings: &TrainingSettings) -> Result<(), ValidationError> {
    if settings.eps.is_finite() && settings.eps > 0.0 {
        Ok(())
    } else {
        Err(ValidationError::new("eps must be positive and finite"))
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingSettings {
    /// A tracing filter directive, e.g. `"fedsum=debug,info"`.
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_the_shipped_config() {
        let settings = Settings::new(PathBuf::from("configs/config.toml")).unwrap();
        assert_eq!(settings.protocol.deadline(), Duration::from_secs(30));
        assert_eq!(settings.protocol.max_uuid_retries, 30);
        assert_eq!(MaskConfig::from(settings.mask), MaskConfig::default());
        assert_eq!(settings.training.max_iterations, 100);
    }

    #[test]
    fn test_invalid_training_settings_are_rejected() {
        let settings = TrainingSettings {
            max_iterations: 10,
            eps: 0.0,
        };
        assert!(settings.validate().is_err());

        let settings = TrainingSettings {
            max_iterations: 0,
            eps: 1e-4,
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_invalid_protocol_settings_are_rejected() {
        let settings = ProtocolSettings {
            deadline_secs: 0,
            max_uuid_retries: 30,
        };
        assert!(settings.validate().is_err());
    }
}
