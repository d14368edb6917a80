//! BLE transport implementation

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::platform::Adapter;
use btlink_core::{LinkError, LinkResult, PeerAddress, Transport, TransportEventSender};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::BleTransportConfig;
use crate::connection::BleConnection;
use crate::discovery::{watch_disconnects, BleDiscovery};
use crate::error::BleTransportError;
use crate::peer::BlePeer;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// BLE Transport
// ----------------------------------------------------------------------------

/// Central-role BLE transport
pub struct BleTransport {
    config: BleTransportConfig,
    discovery: tokio::sync::Mutex<BleDiscovery>,
    connection: BleConnection,
    /// Connected peers keyed by radio address
    peers: Arc<RwLock<HashMap<PeerAddress, BlePeer>>>,
    events: Mutex<Option<TransportEventSender>>,
    /// Per-peer notification pumps
    tasks: Mutex<HashMap<PeerAddress, JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl BleTransport {
    pub fn new(config: BleTransportConfig) -> Self {
        Self {
            discovery: tokio::sync::Mutex::new(BleDiscovery::new(config.clone())),
            connection: BleConnection::new(config.clone()),
            config,
            peers: Arc::new(RwLock::new(HashMap::new())),
            events: Mutex::new(None),
            tasks: Mutex::new(HashMap::new()),
            watcher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BleTransportConfig {
        &self.config
    }

    fn event_sender(&self) -> Result<TransportEventSender, BleTransportError> {
        lock(&self.events).clone().ok_or_else(|| {
            BleTransportError::InvalidConfiguration("transport used before attach".to_string())
        })
    }

    async fn adapter(&self) -> Result<Adapter, BleTransportError> {
        let adapter = self.discovery.lock().await.initialize_adapter().await?;

        let mut watcher = lock(&self.watcher);
        if watcher.is_none() {
            *watcher = Some(tokio::spawn(watch_disconnects(
                adapter.clone(),
                Arc::clone(&self.peers),
                self.event_sender()?,
            )));
        }
        Ok(adapter)
    }

    async fn connect_to_session(&self, session_name: &str) -> Result<PeerAddress, BleTransportError> {
        let events = self.event_sender()?;
        let adapter = self.adapter().await?;
        let mut peer = self
            .discovery
            .lock()
            .await
            .find_session_peer(&adapter, session_name)
            .await?;

        self.connection.connect(&mut peer).await?;
        let pump = match self.connection.start_receiving(&peer, events).await {
            Ok(pump) => pump,
            Err(e) => {
                let _ = self.connection.disconnect(&mut peer).await;
                return Err(e);
            }
        };

        let address = peer.address.clone();
        if let Some(previous) = lock(&self.tasks).insert(address.clone(), pump) {
            previous.abort();
        }
        self.peers.write().await.insert(address.clone(), peer);
        Ok(address)
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        for (_, task) in lock(&self.tasks).drain() {
            task.abort();
        }
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn attach(&self, events: TransportEventSender) -> LinkResult<()> {
        self.config.validate()?;
        *lock(&self.events) = Some(events);
        Ok(())
    }

    async fn is_available(&self) -> bool {
        match self.discovery.lock().await.initialize_adapter().await {
            Ok(_) => true,
            Err(e) => {
                warn!("BLE adapter unavailable: {}", e);
                false
            }
        }
    }

    async fn advertise(&self, identity: &str) -> LinkResult<()> {
        warn!("cannot advertise as {}: BLE peripheral role unavailable", identity);
        Err(BleTransportError::AdvertisingUnsupported.into())
    }

    async fn stop_advertising(&self) -> LinkResult<()> {
        Ok(())
    }

    async fn scan_and_connect(&self, session_name: &str) -> LinkResult<PeerAddress> {
        let address = self.connect_to_session(session_name).await?;
        info!("BLE link to {} established", address);
        Ok(address)
    }

    async fn send(&self, peer: &PeerAddress, data: &[u8]) -> LinkResult<()> {
        let peers = self.peers.read().await;
        let ble_peer = peers
            .get(peer)
            .ok_or_else(|| LinkError::not_connected(peer))?;
        self.connection.send(ble_peer, data).await?;
        Ok(())
    }

    async fn disconnect(&self, peer: &PeerAddress) -> LinkResult<()> {
        if let Some(task) = lock(&self.tasks).remove(peer) {
            task.abort();
        }
        let removed = self.peers.write().await.remove(peer);
        if let Some(mut ble_peer) = removed {
            self.connection.disconnect(&mut ble_peer).await?;
        }
        Ok(())
    }

    fn local_address(&self) -> Option<PeerAddress> {
        // btleplug does not expose the adapter's own address
        None
    }

    fn local_name(&self) -> Option<String> {
        Some(self.config.device_name.clone())
    }
}
