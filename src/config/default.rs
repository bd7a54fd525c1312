use crate::config::{ConfigBackend, Configuration, RenewalConfiguration, default_challenge_address};
use anyhow::Error;
use std::path::{Path, PathBuf};
use url::Url;

pub const LETSENCRYPT_STAGING_DIRECTORY: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

#[derive(Debug, Clone, Default)]
pub struct DefaultConfig {}

impl DefaultConfig {
    pub fn get_config(&self) -> Result<Configuration, Error> {
        Ok(Configuration {
            // Staging until the operator deliberately switches to a production CA
            acme_directory: Url::parse(LETSENCRYPT_STAGING_DIRECTORY)?,
            challenge_address: default_challenge_address(),
            storage_directory: PathBuf::from("certificates"),
            contact: vec![],
            trusted_root: None,
            domains: vec![],
            renewal: RenewalConfiguration::default(),
        })
    }
}

impl ConfigBackend for DefaultConfig {
    fn load<P: AsRef<Path>>(_file: P) -> Result<Configuration, Error> {
        Self::default().get_config()
    }

    fn save<P: AsRef<Path>>(_config: &Configuration, _file: P) -> Result<(), Error> {
        anyhow::bail!("the default configuration cannot be saved")
    }
}
