//! GATT layout and framing for btlink over BLE
//!
//! The link is a byte stream carried over a Nordic-UART-style service: the
//! central writes to TX and receives notifications on RX. There is no framing
//! on top; sockets reassemble reads from whatever chunk sizes arrive.

use uuid::Uuid;

// ----------------------------------------------------------------------------
// BLE Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// btlink BLE service UUID
pub const BTLINK_SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/// Characteristic the central writes to
pub const BTLINK_TX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/// Characteristic the central is notified on
pub const BTLINK_RX_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

// ----------------------------------------------------------------------------
// Chunking
// ----------------------------------------------------------------------------

/// Split a payload into writes of at most `max_chunk_size` bytes
pub fn chunk_payload(data: &[u8], max_chunk_size: usize) -> impl Iterator<Item = &[u8]> {
    data.chunks(max_chunk_size.max(1))
}
