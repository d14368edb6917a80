//! BLE connection management and data transmission

use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use btlink_core::{TransportEvent, TransportEventSender};
use futures::stream::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace};

use crate::config::BleTransportConfig;
use crate::error::BleTransportError;
use crate::peer::BlePeer;
use crate::protocol::{chunk_payload, BTLINK_RX_CHARACTERISTIC_UUID, BTLINK_TX_CHARACTERISTIC_UUID};

// ----------------------------------------------------------------------------
// Connection Management
// ----------------------------------------------------------------------------

/// Handles BLE connections and data transmission
pub struct BleConnection {
    config: BleTransportConfig,
}

impl BleConnection {
    pub fn new(config: BleTransportConfig) -> Self {
        Self { config }
    }

    /// Connect to a discovered peer and discover its services
    pub async fn connect(&self, peer: &mut BlePeer) -> Result<(), BleTransportError> {
        if peer.is_connected() {
            return Ok(());
        }
        peer.mark_connecting();

        match timeout(self.config.connection_timeout, peer.peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                peer.mark_failed();
                error!("Failed to connect to peer {}: {}", peer.address, e);
                return Err(BleTransportError::ConnectionFailed(e.to_string()));
            }
            Err(_) => {
                peer.mark_failed();
                error!("Connection to peer {} timed out", peer.address);
                return Err(BleTransportError::ConnectionTimeout);
            }
        }

        if let Err(e) = peer.peripheral.discover_services().await {
            peer.mark_failed();
            // Do not leave a half-open link behind
            let _ = peer.peripheral.disconnect().await;
            return Err(BleTransportError::ServiceDiscoveryFailed(e.to_string()));
        }

        peer.mark_connected();
        info!("Connected to peer: {} ({})", peer.address, peer.device_name);
        Ok(())
    }

    /// Subscribe to the peer's RX notifications and forward them as received bytes
    pub async fn start_receiving(
        &self,
        peer: &BlePeer,
        events: TransportEventSender,
    ) -> Result<JoinHandle<()>, BleTransportError> {
        let rx_char = find_characteristic(&peer.peripheral, BTLINK_RX_CHARACTERISTIC_UUID)?;
        peer.peripheral
            .subscribe(&rx_char)
            .await
            .map_err(|e| BleTransportError::SubscriptionFailed(e.to_string()))?;

        let mut notifications = peer
            .peripheral
            .notifications()
            .await
            .map_err(|e| BleTransportError::SubscriptionFailed(e.to_string()))?;

        let address = peer.address.clone();
        Ok(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != BTLINK_RX_CHARACTERISTIC_UUID {
                    continue;
                }
                trace!("{} <- {}", address, hex::encode(&notification.value));
                let event = TransportEvent::BytesReceived {
                    peer: address.clone(),
                    data: notification.value,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            debug!("Notification handler for peer {} ended", address);
        }))
    }

    /// Write `data` to the peer's TX characteristic in MTU-sized chunks
    pub async fn send(&self, peer: &BlePeer, data: &[u8]) -> Result<(), BleTransportError> {
        if !peer.is_connected() {
            return Err(BleTransportError::PeerNotConnected);
        }
        let tx_char = find_characteristic(&peer.peripheral, BTLINK_TX_CHARACTERISTIC_UUID)?;

        for chunk in chunk_payload(data, self.config.max_chunk_size) {
            trace!("{} -> {}", peer.address, hex::encode(chunk));
            peer.peripheral
                .write(&tx_char, chunk, WriteType::WithoutResponse)
                .await
                .map_err(|e| BleTransportError::WriteFailed(e.to_string()))?;
        }

        debug!("Sent {} bytes to peer {}", data.len(), peer.address);
        Ok(())
    }

    pub async fn disconnect(&self, peer: &mut BlePeer) -> Result<(), BleTransportError> {
        if peer.is_connected() {
            peer.peripheral.disconnect().await?;
            info!("Disconnected from peer: {}", peer.address);
        }
        peer.mark_disconnected();
        Ok(())
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    uuid: uuid::Uuid,
) -> Result<Characteristic, BleTransportError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| BleTransportError::CharacteristicNotFound {
            characteristic: uuid.to_string(),
        })
}
