use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::types::EUI64Prefix;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub join: JoinConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinConfig {
    /// JoinEUI prefixes this instance claims, e.g. "42ff000000000000/16".
    #[serde(default)]
    pub join_eui_prefixes: Vec<EUI64Prefix>,
    /// JSON file with the device records to load at startup.
    pub provisioning: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: "0.0.0.0:1700".to_string(),
            },
            join: JoinConfig {
                join_eui_prefixes: Vec::new(),
                provisioning: None,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}
