//! Bluetooth Low Energy transport for btlink
//!
//! This crate provides a BLE transport that implements the `Transport` trait from
//! `btlink-core`, so a `ConnectionManager` can run its searcher role over a real
//! radio.
//!
//! ## Architecture
//!
//! - [`config`] - Transport configuration and settings
//! - [`error`] - Error types specific to BLE transport
//! - [`protocol`] - GATT service layout and chunking
//! - [`peer`] - Peer state tracking
//! - [`discovery`] - Adapter setup and scanning for session publishers
//! - [`connection`] - Connecting, subscribing and writing to peers
//! - [`transport`] - Main transport implementation
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use btlink_ble::{BleTransport, BleTransportConfig};
//! use btlink_core::{ConnectionManager, LinkConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(BleTransport::new(BleTransportConfig::new()));
//! let mut manager = ConnectionManager::new(LinkConfig::new("arena"), transport)?;
//! let mut events = manager.take_event_receiver().unwrap();
//!
//! manager.start_searching()?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Support
//!
//! btleplug only exposes the central role, so this transport can search and
//! connect but cannot advertise. `advertise` fails with
//! [`BleTransportError::AdvertisingUnsupported`].

mod config;
mod connection;
mod discovery;
mod error;
mod peer;
mod protocol;
mod transport;

// Public API exports
pub use config::BleTransportConfig;
pub use error::BleTransportError;
pub use peer::{BlePeer, ConnectionState};
pub use protocol::{
    chunk_payload, BTLINK_RX_CHARACTERISTIC_UUID, BTLINK_SERVICE_UUID,
    BTLINK_TX_CHARACTERISTIC_UUID,
};
pub use transport::BleTransport;

// Re-export Transport trait for convenience
pub use btlink_core::Transport;
