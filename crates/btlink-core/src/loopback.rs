//! In-process loopback transport
//!
//! A [`LoopbackNetwork`] is a shared registry of simulated radios. Each
//! [`LoopbackTransport`] registers itself on the network under an address and
//! device name; advertising, scanning, sending and disconnecting are resolved
//! against the registry and delivered to the remote side as
//! [`TransportEvent`]s. Outgoing data can be split into fixed-size chunks to
//! exercise reassembly in the sockets.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::errors::{LinkError, LinkResult};
use crate::socket::lock;
use crate::transport::{matches_session, Transport, TransportEvent, TransportEventSender};
use crate::types::PeerAddress;

#[derive(Default)]
struct Device {
    events: Option<TransportEventSender>,
    advertised_as: Option<String>,
    radio_off: bool,
}

impl Device {
    fn is_available(&self) -> bool {
        self.events.is_some() && !self.radio_off
    }
}

#[derive(Default)]
struct NetworkInner {
    devices: HashMap<PeerAddress, Device>,
    links: HashSet<(PeerAddress, PeerAddress)>,
}

impl NetworkInner {
    fn link_key(a: &PeerAddress, b: &PeerAddress) -> (PeerAddress, PeerAddress) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    fn notify(&self, address: &PeerAddress, event: TransportEvent) -> bool {
        match self.devices.get(address).and_then(|d| d.events.as_ref()) {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }
}

// ----------------------------------------------------------------------------
// Loopback Network
// ----------------------------------------------------------------------------

/// Shared medium connecting loopback transports
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a link currently exists between two devices
    pub fn is_linked(&self, a: &PeerAddress, b: &PeerAddress) -> bool {
        lock(&self.inner)
            .links
            .contains(&NetworkInner::link_key(a, b))
    }

    /// Sever a link as if the radio lost it, notifying both ends
    pub fn drop_link(&self, a: &PeerAddress, b: &PeerAddress) -> bool {
        let mut inner = lock(&self.inner);
        if !inner.links.remove(&NetworkInner::link_key(a, b)) {
            return false;
        }
        inner.notify(a, TransportEvent::Disconnected { peer: b.clone() });
        inner.notify(b, TransportEvent::Disconnected { peer: a.clone() });
        debug!("loopback link {} <-> {} dropped", a, b);
        true
    }

    /// Switch a device's radio on or off. Turning it off stops advertising;
    /// existing links are left to the caller to drop.
    pub fn set_radio_enabled(&self, address: &PeerAddress, enabled: bool) -> bool {
        let mut inner = lock(&self.inner);
        let Some(device) = inner.devices.get_mut(address) else {
            return false;
        };
        device.radio_off = !enabled;
        if !enabled {
            device.advertised_as = None;
        }
        debug!("loopback radio {} {}", address, if enabled { "on" } else { "off" });
        true
    }

    /// Report a socket-level radio failure to one device
    pub fn inject_socket_failure(&self, address: &PeerAddress, reason: &str) -> bool {
        lock(&self.inner).notify(
            address,
            TransportEvent::SocketFailure {
                reason: reason.to_string(),
            },
        )
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("LoopbackNetwork")
            .field("devices", &inner.devices.len())
            .field("links", &inner.links.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Loopback Transport
// ----------------------------------------------------------------------------

/// One simulated radio on a [`LoopbackNetwork`]
#[derive(Debug)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    address: PeerAddress,
    name: String,
    chunk_size: Option<usize>,
}

impl LoopbackTransport {
    /// Register a device on `network`
    pub fn new(network: &LoopbackNetwork, address: impl Into<PeerAddress>, name: impl Into<String>) -> Self {
        let address = address.into();
        lock(&network.inner)
            .devices
            .entry(address.clone())
            .or_default();
        Self {
            network: network.clone(),
            address,
            name: name.into(),
            chunk_size: None,
        }
    }

    /// Split every send into chunks of at most `size` bytes
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    fn ensure_radio(&self, inner: &NetworkInner) -> LinkResult<()> {
        match inner.devices.get(&self.address) {
            Some(device) if !device.radio_off => Ok(()),
            _ => Err(LinkError::transport(format!("{} radio unavailable", self.address))),
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn attach(&self, events: TransportEventSender) -> LinkResult<()> {
        let mut inner = lock(&self.network.inner);
        inner.devices.entry(self.address.clone()).or_default().events = Some(events);
        Ok(())
    }

    async fn is_available(&self) -> bool {
        lock(&self.network.inner)
            .devices
            .get(&self.address)
            .is_some_and(Device::is_available)
    }

    async fn advertise(&self, identity: &str) -> LinkResult<()> {
        let mut inner = lock(&self.network.inner);
        self.ensure_radio(&inner)?;
        inner.devices.entry(self.address.clone()).or_default().advertised_as = Some(identity.to_string());
        debug!("{} advertising as {}", self.address, identity);
        Ok(())
    }

    async fn stop_advertising(&self) -> LinkResult<()> {
        let mut inner = lock(&self.network.inner);
        if let Some(device) = inner.devices.get_mut(&self.address) {
            device.advertised_as = None;
        }
        Ok(())
    }

    async fn scan_and_connect(&self, session_name: &str) -> LinkResult<PeerAddress> {
        let mut inner = lock(&self.network.inner);
        self.ensure_radio(&inner)?;
        let mut candidates: Vec<&PeerAddress> = inner
            .devices
            .iter()
            .filter(|(address, device)| {
                *address != &self.address
                    && device
                        .advertised_as
                        .as_deref()
                        .is_some_and(|name| matches_session(name, session_name))
            })
            .map(|(address, _)| address)
            .collect();
        candidates.sort();
        let server = candidates
            .first()
            .map(|address| (*address).clone())
            .ok_or_else(|| LinkError::transport(format!("no publisher found for session {}", session_name)))?;

        inner
            .links
            .insert(NetworkInner::link_key(&self.address, &server));
        if !inner.notify(
            &server,
            TransportEvent::InboundConnection {
                peer: self.address.clone(),
            },
        ) {
            inner.links.remove(&NetworkInner::link_key(&self.address, &server));
            return Err(LinkError::transport(format!("{} is not listening", server)));
        }
        debug!("{} connected to {}", self.address, server);
        Ok(server)
    }

    async fn send(&self, peer: &PeerAddress, data: &[u8]) -> LinkResult<()> {
        let inner = lock(&self.network.inner);
        if !inner.links.contains(&NetworkInner::link_key(&self.address, peer)) {
            return Err(LinkError::not_connected(peer));
        }

        let chunk_size = self.chunk_size.unwrap_or(data.len()).max(1);
        for chunk in data.chunks(chunk_size) {
            let event = TransportEvent::BytesReceived {
                peer: self.address.clone(),
                data: chunk.to_vec(),
            };
            if !inner.notify(peer, event) {
                return Err(LinkError::transport(format!("{} stopped listening", peer)));
            }
        }
        trace!("{} -> {}: {} bytes", self.address, peer, data.len());
        Ok(())
    }

    async fn disconnect(&self, peer: &PeerAddress) -> LinkResult<()> {
        let mut inner = lock(&self.network.inner);
        if inner.links.remove(&NetworkInner::link_key(&self.address, peer)) {
            inner.notify(
                peer,
                TransportEvent::Disconnected {
                    peer: self.address.clone(),
                },
            );
        }
        Ok(())
    }

    fn local_address(&self) -> Option<PeerAddress> {
        Some(self.address.clone())
    }

    fn local_name(&self) -> Option<String> {
        Some(self.name.clone())
    }
}
