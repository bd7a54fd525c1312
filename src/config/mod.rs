//! The daemon's configuration file.

use crate::config::default::DefaultConfig;
use crate::config::toml::TomlConfiguration;
use crate::manager::{DEFAULT_DEBOUNCE, DEFAULT_LEAD_TIME, DEFAULT_RETRY_BACKOFF, ManagerSettings};
use crate::time::ParsedDuration;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

mod default;
mod toml;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub acme_directory: Url,
    #[serde(default = "default_challenge_address")]
    pub challenge_address: SocketAddr,
    #[serde(default = "default_storage_directory")]
    pub storage_directory: PathBuf,
    /// Contact URLs for the ACME account, e.g. `mailto:admin@example.com`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<Url>,
    /// Additional trusted root certificate (PEM), for private or test CAs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_root: Option<PathBuf>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub renewal: RenewalConfiguration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewalConfiguration {
    #[serde(default = "default_lead_time")]
    pub lead_time: ParsedDuration,
    #[serde(default = "default_debounce")]
    pub debounce: ParsedDuration,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: ParsedDuration,
}

impl Default for RenewalConfiguration {
    fn default() -> Self {
        Self {
            lead_time: default_lead_time(),
            debounce: default_debounce(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

impl Configuration {
    pub fn manager_settings(&self) -> ManagerSettings {
        let mut settings = ManagerSettings::new(self.storage_directory.clone());
        settings.challenge_address = self.challenge_address;
        settings.lead_time = *self.renewal.lead_time;
        settings.debounce = *self.renewal.debounce;
        settings.retry_backoff = *self.renewal.retry_backoff;
        settings
    }
}

pub fn default_challenge_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], crate::manager::DEFAULT_CHALLENGE_PORT))
}

fn default_storage_directory() -> PathBuf {
    PathBuf::from("certificates")
}

fn default_lead_time() -> ParsedDuration {
    DEFAULT_LEAD_TIME.into()
}

fn default_debounce() -> ParsedDuration {
    DEFAULT_DEBOUNCE.into()
}

fn default_retry_backoff() -> ParsedDuration {
    DEFAULT_RETRY_BACKOFF.into()
}

pub trait ConfigBackend {
    fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error>;
    fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), anyhow::Error>;
}

/// Loads the configuration from `file`. A missing file is created with the default configuration.
pub fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, anyhow::Error> {
    if file.as_ref().exists() {
        TomlConfiguration::load(file)
    } else {
        let default = DefaultConfig::load(&file)?;
        TomlConfiguration::save(&default, &file)?;
        Ok(default)
    }
}

pub fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), anyhow::Error> {
    TomlConfiguration::save(config, file)
}
