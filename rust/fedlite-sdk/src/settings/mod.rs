//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables with the
//! `FEDLITE` prefix and `__` as the section separator, for instance `FEDLITE_API__BASE_URL`.
//!
//! A configuration file looks like this:
//!
//! ```text
//! [api]
//! base_url = "https://fl.example.com:6666"
//! timeout_secs = 60
//!
//! [task]
//! fl_id = "device-0001"
//! fl_name = "lenet"
//! train_data_size = 512
//!
//! [privacy]
//! dp_norm_clip_factor = 1.0
//!
//! [log]
//! filter = "info,fedlite_sdk=debug"
//! ```

mod privacy;
mod task;

pub use self::{privacy::PrivacySettings, task::TaskSettings};

use std::{fmt, path::Path, time::Duration};

use config::{Config, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationErrors};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] config::ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub api: ApiSettings,
    #[validate]
    pub task: TaskSettings,
    #[validate]
    #[serde(default)]
    pub privacy: PrivacySettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, config::ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fedlite").separator("__"))?;
        config.try_into()
    }
}

#[derive(Debug, Clone, Validate, Deserialize)]
/// Coordinator API settings.
pub struct ApiSettings {
    /// The URL of the coordinator.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// base_url = "https://127.0.0.1:6666"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLITE_API__BASE_URL=https://127.0.0.1:6666
    /// ```
    #[validate(url)]
    pub base_url: String,

    /// The connect and write timeout of a request, in seconds. Reading a response may take three
    /// times as long.
    #[validate(range(min = 1))]
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    60
}

impl ApiSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(3 * self.timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
///
/// The library never installs a subscriber itself. An application usually does:
///
/// ```ignore
/// tracing_subscriber::fmt()
///     .with_env_filter(settings.log.filter)
///     .init();
/// ```
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLITE_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.25/tracing_subscriber/filter/struct.EnvFilter.html#directives
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
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.25/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
