//! Error types for btlink
//!
//! `LinkError` is both the `Err` type of synchronous manager operations and the
//! failure reason carried by read/write failure events, so it is `Clone`.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors surfaced by sockets, the connection manager and transports
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Operation attempted on a socket with no live transport link
    #[error("Peer not connected: {peer}")]
    NotConnected { peer: String },

    /// Operation referenced a peer identity absent from the socket map
    #[error("Unknown peer: {peer}")]
    UnknownPeer { peer: String },

    /// A read or write deadline elapsed unsatisfied
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Pending operation dropped by an explicit disconnect or shutdown
    #[error("Operation cancelled: {reason}")]
    Cancelled { reason: String },

    /// Opaque lower-layer error surfaced as-is
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Read length must be at least one byte")]
    InvalidReadLength,

    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("Maximum connections reached ({max})")]
    MaxConnectionsReached { max: usize },

    #[error("Connection manager has been shut down")]
    ShutDown,

    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
}

impl LinkError {
    /// Create a not-connected error for a peer
    pub fn not_connected(peer: impl ToString) -> Self {
        Self::NotConnected {
            peer: peer.to_string(),
        }
    }

    /// Create an unknown-peer error
    pub fn unknown_peer(peer: impl ToString) -> Self {
        Self::UnknownPeer {
            peer: peer.to_string(),
        }
    }

    /// Create a cancellation error with a reason
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Wrap a lower-layer error
    pub fn transport(err: impl ToString) -> Self {
        Self::TransportFailure(err.to_string())
    }

    /// Whether this is the terminal event for a dropped operation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type for btlink operations
pub type LinkResult<T> = Result<T, LinkError>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LinkError::not_connected("aa:bb");
        assert_eq!(err.to_string(), "Peer not connected: aa:bb");

        let err = LinkError::Timeout { duration_ms: 100 };
        assert_eq!(err.to_string(), "Operation timed out after 100ms");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_cancelled_predicate() {
        assert!(LinkError::cancelled("shutdown").is_cancelled());
        assert!(!LinkError::ShutDown.is_cancelled());
    }
}
