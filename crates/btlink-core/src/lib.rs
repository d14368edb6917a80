//! btlink Core
//!
//! Virtual sockets over a short-range wireless link. A [`ConnectionManager`]
//! either publishes itself and accepts inbound peers or searches for a
//! publisher of the same session and connects to it. Each live peer link is
//! represented by a [`VirtualSocket`] that reassembles arbitrarily chunked
//! incoming bytes into fixed-length reads, served strictly in request order.
//!
//! All outcomes are delivered asynchronously as [`LinkEvent`]s carrying the
//! caller-chosen [`Tag`] of the operation they complete.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod events;
pub mod loopback;
pub mod manager;
pub mod read_queue;
pub mod socket;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{LinkConfig, MAX_SUPPORTED_CONNECTIONS};
pub use errors::{LinkError, LinkResult};
pub use events::{LinkEvent, LinkEventReceiver, LinkEventSender};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use manager::ConnectionManager;
pub use read_queue::{ReadQueue, ReadRequest, RequestId};
pub use socket::{SocketStats, VirtualSocket};
pub use transport::{
    advertised_name, matches_session, Transport, TransportEvent, TransportEventReceiver,
    TransportEventSender,
};
pub use types::{LinkState, PeerAddress, Role, Tag};
