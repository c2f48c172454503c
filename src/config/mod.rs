//! Configuration management
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `SIPCHAN__<SECTION>__<KEY>` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub routing: RoutingConfig,
    pub codecs: CodecConfig,
    /// Called number to destination table used by the bundled local bus
    pub routes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub bind_address: String,
    pub bind_port: u16,
    /// Keep transport-level addressing instead of following Contact headers
    pub ignore_via: bool,
    /// Answer REGISTER requests
    pub registrar: bool,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Routing tasks allowed in flight before new INVITEs get 503
    pub max_pending: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub default: bool,
    #[serde(flatten)]
    pub overrides: HashMap<String, bool>,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 5060,
            ignore_via: false,
            registrar: false,
            user_agent: "sipchan".to_string(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { max_pending: 5 }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            default: true,
            overrides: HashMap::new(),
        }
    }
}

impl SipConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bind_address '{}'", self.bind_address)))?;
        Ok(SocketAddr::new(ip, self.bind_port))
    }
}

impl Config {
    /// Load defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config: Config = builder
            .add_source(config::Environment::with_prefix("SIPCHAN").separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.sip.bind_addr()?;
        if self.routing.max_pending == 0 {
            return Err(ConfigError::Invalid("routing.max_pending must be positive".into()));
        }
        Ok(())
    }
}
