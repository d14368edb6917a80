//! BLE peer management and state

use btleplug::api::Peripheral as _;
use btleplug::platform::{Peripheral as PlatformPeripheral, PeripheralId};
use btlink_core::PeerAddress;

// ----------------------------------------------------------------------------
// Peer State Management
// ----------------------------------------------------------------------------

/// Connection state for a BLE peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// A publisher found while scanning, and the link state towards it
#[derive(Debug, Clone)]
pub struct BlePeer {
    /// Radio address, used as the socket key
    pub address: PeerAddress,
    /// BLE peripheral
    pub peripheral: PlatformPeripheral,
    /// Advertised device name
    pub device_name: String,
    /// Connection state
    pub connection_state: ConnectionState,
}

impl BlePeer {
    /// Create a new BLE peer from a discovered peripheral
    pub fn new(peripheral: PlatformPeripheral, device_name: String) -> Self {
        Self {
            address: peer_address(&peripheral),
            peripheral,
            device_name,
            connection_state: ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    pub fn mark_connecting(&mut self) {
        self.connection_state = ConnectionState::Connecting;
    }

    pub fn mark_connected(&mut self) {
        self.connection_state = ConnectionState::Connected;
    }

    pub fn mark_failed(&mut self) {
        self.connection_state = ConnectionState::Failed;
    }

    pub fn mark_disconnected(&mut self) {
        self.connection_state = ConnectionState::Disconnected;
    }

    /// Get peripheral ID for matching adapter events
    pub fn peripheral_id(&self) -> PeripheralId {
        self.peripheral.id()
    }
}

/// Address under which a peripheral's socket is keyed
pub fn peer_address(peripheral: &PlatformPeripheral) -> PeerAddress {
    PeerAddress::new(peripheral.address().to_string())
}
