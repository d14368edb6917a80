//! Error types for BLE transport

use btlink_core::LinkError;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors specific to the BLE transport
#[derive(Error, Debug)]
pub enum BleTransportError {
    #[error("Failed to connect to peer: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Peer not found: {peer}")]
    PeerNotFound { peer: String },

    #[error("Peer not connected")]
    PeerNotConnected,

    #[error("No publisher found for session {session}")]
    NoPublisherFound { session: String },

    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("Characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: String },

    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    #[error("Failed to write to characteristic: {0}")]
    WriteFailed(String),

    #[error("Failed to get BLE events: {0}")]
    EventStreamFailed(String),

    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Advertising is not supported by this transport")]
    AdvertisingUnsupported,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("BLE error: {0}")]
    Btleplug(#[from] btleplug::Error),
}

impl From<BleTransportError> for LinkError {
    fn from(err: BleTransportError) -> Self {
        match err {
            BleTransportError::PeerNotFound { peer } => LinkError::NotConnected { peer },
            BleTransportError::InvalidConfiguration(reason) => {
                LinkError::InvalidConfiguration { reason }
            }
            other => LinkError::transport(other),
        }
    }
}
