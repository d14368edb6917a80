//! Error handling for the btlink CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Link error: {0}")]
    Link(#[from] btlink_core::LinkError),

    #[error("BLE transport error: {0}")]
    Ble(#[from] btlink_ble::BleTransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Unexpected event: {0}")]
    UnexpectedEvent(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
