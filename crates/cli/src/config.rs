use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tradebridge_brokers_common::{Credentials, HubConfig, TransportConfig};
use tradebridge_brokers_synthetic::BrokerConfig;

/// Contents of the TOML config file. Every table is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub transport: TransportConfig,
    pub hub: HubConfig,
    pub broker: BrokerConfig,
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub user: Option<String>,
    pub password: Option<String>,
    pub app_name: Option<String>,
}

impl AppConfig {
    /// Read `path`, or fall back to defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Credentials from the file, overridden by command-line or env values.
    pub fn credentials(&self, user: Option<String>, password: Option<String>) -> Option<Credentials> {
        let user = user.or_else(|| self.credentials.user.clone())?;
        let password = password.or_else(|| self.credentials.password.clone())?;
        Some(Credentials {
            user,
            password,
            app_name: self.credentials.app_name.clone(),
        })
    }
}
