//! btlink CLI configuration
//!
//! A single TOML file with a `[link]` table for the connection manager and a
//! `[ble]` table for the radio. Missing tables and fields fall back to their
//! defaults.

use std::path::Path;

use btlink_ble::BleTransportConfig;
use btlink_core::LinkConfig;
use serde::{Deserialize, Serialize};

use crate::error::{CliError, Result};

/// Complete configuration for the btlink CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Connection manager settings
    pub link: LinkConfig,
    /// BLE transport settings
    pub ble: BleTransportConfig,
}

impl CliConfig {
    /// Load and validate a configuration file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Override the session name from the command line
    pub fn with_session(mut self, session: Option<String>) -> Self {
        if let Some(session) = session {
            self.link.session_name = session;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.link.validate()?;
        self.ble
            .validate()
            .map_err(|e| CliError::Config(e.to_string()))
    }
}
