//! Configuration management

use config::{Config as Loader, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub sip: SipConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Dialplan context used for endpoints that do not carry their own
    pub default_context: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sip: SipConfig {
                bind_address: "0.0.0.0".to_string(),
                bind_port: 5060,
                domain: "localhost".to_string(),
            },
            transfer: TransferConfig {
                default_context: "default".to_string(),
            },
        }
    }
}

impl Config {
    /// Layer defaults, an optional config file named by `HANDOVER_CONFIG`,
    /// and `HANDOVER_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Loader::builder().add_source(Loader::try_from(&Config::default())?);
        if let Ok(path) = std::env::var("HANDOVER_CONFIG") {
            builder = builder.add_source(File::with_name(&path));
        }
        builder = builder.add_source(Environment::with_prefix("HANDOVER").separator("__"));
        builder.build()?.try_deserialize()
    }
}
