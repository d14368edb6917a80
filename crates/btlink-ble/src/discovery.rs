//! BLE adapter setup and scanning for session publishers

use std::collections::HashMap;
use std::sync::Arc;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use btlink_core::{matches_session, PeerAddress, TransportEvent, TransportEventSender};
use futures::stream::StreamExt;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BleTransportConfig;
use crate::error::BleTransportError;
use crate::peer::BlePeer;
use crate::protocol::BTLINK_SERVICE_UUID;

// ----------------------------------------------------------------------------
// Discovery Implementation
// ----------------------------------------------------------------------------

/// Handles BLE adapter access and device discovery
pub struct BleDiscovery {
    config: BleTransportConfig,
    adapter: Option<Adapter>,
}

impl BleDiscovery {
    pub fn new(config: BleTransportConfig) -> Self {
        Self {
            config,
            adapter: None,
        }
    }

    /// Initialize the first BLE adapter
    pub async fn initialize_adapter(&mut self) -> Result<Adapter, BleTransportError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }

        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BleTransportError::AdapterNotAvailable)?;

        info!("BLE adapter initialized");
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    /// Scan until a device advertising `session_name` shows up or the scan times out
    pub async fn find_session_peer(
        &self,
        adapter: &Adapter,
        session_name: &str,
    ) -> Result<BlePeer, BleTransportError> {
        let mut events = adapter
            .events()
            .await
            .map_err(|e| BleTransportError::EventStreamFailed(e.to_string()))?;

        adapter
            .start_scan(ScanFilter {
                services: vec![BTLINK_SERVICE_UUID],
            })
            .await?;
        info!("scanning for session {}", session_name);

        let result = self.scan_events(adapter, &mut events, session_name).await;

        if let Err(e) = adapter.stop_scan().await {
            warn!("failed to stop BLE scan: {}", e);
        }
        result
    }

    async fn scan_events(
        &self,
        adapter: &Adapter,
        events: &mut (impl futures::Stream<Item = CentralEvent> + Unpin),
        session_name: &str,
    ) -> Result<BlePeer, BleTransportError> {
        // Devices the adapter already knows about
        for peripheral in adapter.peripherals().await? {
            if let Some(peer) = session_peer(peripheral, session_name).await {
                return Ok(peer);
            }
        }

        let deadline = Instant::now() + self.config.scan_timeout;
        loop {
            let event = match tokio::time::timeout_at(deadline, events.next()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    return Err(BleTransportError::EventStreamFailed(
                        "adapter event stream ended".to_string(),
                    ))
                }
                Err(_) => {
                    return Err(BleTransportError::NoPublisherFound {
                        session: session_name.to_string(),
                    })
                }
            };

            if let CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) = event {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                if let Some(peer) = session_peer(peripheral, session_name).await {
                    return Ok(peer);
                }
            }
        }
    }
}

async fn session_peer(peripheral: Peripheral, session_name: &str) -> Option<BlePeer> {
    let properties = peripheral.properties().await.ok()??;
    let name = properties.local_name?;
    if !matches_session(&name, session_name) {
        return None;
    }
    debug!("discovered session publisher {} ({})", name, properties.address);
    Some(BlePeer::new(peripheral, name))
}

// ----------------------------------------------------------------------------
// Disconnect Watcher
// ----------------------------------------------------------------------------

/// Forward adapter-level disconnects of known peers to the transport events
pub async fn watch_disconnects(
    adapter: Adapter,
    peers: Arc<RwLock<HashMap<PeerAddress, BlePeer>>>,
    events: TransportEventSender,
) {
    let mut central_events = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events.send(TransportEvent::SocketFailure {
                reason: format!("BLE event stream unavailable: {}", e),
            });
            return;
        }
    };

    while let Some(event) = central_events.next().await {
        let CentralEvent::DeviceDisconnected(id) = event else {
            continue;
        };
        let removed = {
            let mut peers_lock = peers.write().await;
            let address = peers_lock
                .iter()
                .find(|(_, peer)| peer.peripheral_id() == id)
                .map(|(address, _)| address.clone());
            address.and_then(|address| peers_lock.remove(&address))
        };
        if let Some(mut peer) = removed {
            peer.mark_disconnected();
            info!("peer {} disconnected", peer.address);
            if events
                .send(TransportEvent::Disconnected { peer: peer.address })
                .is_err()
            {
                break;
            }
        }
    }

    let _ = events.send(TransportEvent::SocketFailure {
        reason: "BLE adapter event stream ended".to_string(),
    });
}
