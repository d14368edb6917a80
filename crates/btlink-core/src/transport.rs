//! Transport abstraction
//!
//! The physical radio stack is an external collaborator. A transport delivers
//! raw byte chunks and connection lifecycle notifications on the event channel
//! handed to it by [`Transport::attach`], and executes advertise / connect /
//! send / disconnect requests issued by the connection manager.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::LinkResult;
use crate::types::PeerAddress;

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

// ----------------------------------------------------------------------------
// Transport Events
// ----------------------------------------------------------------------------

/// Notifications flowing from the transport to the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A searcher connected to us while advertising
    InboundConnection { peer: PeerAddress },
    /// A chunk of bytes arrived from a peer, in order and without duplicates
    BytesReceived { peer: PeerAddress, data: Vec<u8> },
    /// The link to a peer is gone
    Disconnected { peer: PeerAddress },
    /// The radio failed at socket level (out of sockets, adapter reset, ...)
    SocketFailure { reason: String },
}

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Unified interface over a short-range wireless link
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attach the channel that receives this transport's notifications
    fn attach(&self, events: TransportEventSender) -> LinkResult<()>;

    /// Whether the radio is present and usable right now
    async fn is_available(&self) -> bool;

    /// Become discoverable under `identity` and accept inbound connections
    async fn advertise(&self, identity: &str) -> LinkResult<()>;

    /// Stop being discoverable; existing links are kept
    async fn stop_advertising(&self) -> LinkResult<()>;

    /// Scan for an advertiser whose name ends with `session_name` and connect to it
    async fn scan_and_connect(&self, session_name: &str) -> LinkResult<PeerAddress>;

    /// Hand bytes to the link for `peer`; resolves once the transport accepted them
    async fn send(&self, peer: &PeerAddress, data: &[u8]) -> LinkResult<()>;

    /// Tear down the link to `peer`
    async fn disconnect(&self, peer: &PeerAddress) -> LinkResult<()>;

    /// This device's own address, once the radio has one
    fn local_address(&self) -> Option<PeerAddress>;

    /// This device's human-readable name
    fn local_name(&self) -> Option<String>;
}

// ----------------------------------------------------------------------------
// Naming Helpers
// ----------------------------------------------------------------------------

/// Name a publisher advertises under: `<local>-<session>` unless already suffixed
pub fn advertised_name(local_name: &str, session_name: &str) -> String {
    if local_name.ends_with(session_name) {
        local_name.to_string()
    } else if local_name.is_empty() {
        session_name.to_string()
    } else {
        format!("{}-{}", local_name, session_name)
    }
}

/// Whether a discovered device name belongs to `session_name`
pub fn matches_session(device_name: &str, session_name: &str) -> bool {
    !session_name.is_empty() && device_name.ends_with(session_name)
}
