//! BLE transport configuration

use std::time::Duration;

use crate::error::BleTransportError;

/// Largest chunk a single write without response can carry at the default MTU
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 244;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for BLE transport
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BleTransportConfig {
    /// Maximum time a single scan looks for a session publisher
    pub scan_timeout: Duration,
    /// Maximum time to wait for connection
    pub connection_timeout: Duration,
    /// Bytes per GATT write
    pub max_chunk_size: usize,
    /// Name this device reports as its own
    pub device_name: String,
}

impl Default for BleTransportConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(5),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            device_name: "btlink".to_string(),
        }
    }
}

impl BleTransportConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set scan timeout
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set maximum chunk size
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    /// Set the local device name
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    pub fn validate(&self) -> Result<(), BleTransportError> {
        if self.max_chunk_size == 0 || self.max_chunk_size > 512 {
            return Err(BleTransportError::InvalidConfiguration(format!(
                "chunk size {} outside 1..=512",
                self.max_chunk_size
            )));
        }
        if self.scan_timeout.is_zero() {
            return Err(BleTransportError::InvalidConfiguration(
                "scan timeout cannot be zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BleTransportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_chunk_size, DEFAULT_MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_rejects_oversized_chunks() {
        let config = BleTransportConfig::new().with_max_chunk_size(1024);
        assert!(config.validate().is_err());
        let config = BleTransportConfig::new().with_max_chunk_size(0);
        assert!(config.validate().is_err());
    }
}
