//! Core types for btlink
//!
//! Newtypes for peer identity and operation correlation, plus the role and
//! lifecycle enums shared by sockets and the connection manager.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::LinkError;

// ----------------------------------------------------------------------------
// Peer Address
// ----------------------------------------------------------------------------

/// Identity of a peer as exposed by the transport (a radio address or device name)
///
/// The address is the key of the connection manager's socket map, so it must be
/// stable for a given peer across the advertising and searching roles.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Create a new address
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Get the address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the inner string
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerAddress {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(LinkError::InvalidConfiguration {
                reason: "peer address cannot be empty".to_string(),
            });
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PeerAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Deref for PeerAddress {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Borrow<str> for PeerAddress {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Correlation Tag
// ----------------------------------------------------------------------------

/// Opaque caller-chosen id threaded through an operation to its completion event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Tag(pub u64);

impl Tag {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for Tag {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ----------------------------------------------------------------------------
// Roles and Lifecycle
// ----------------------------------------------------------------------------

/// Which side of the link this device plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Advertises itself and accepts inbound connections
    Publisher,
    /// Scans for a publisher and connects to it
    Searcher,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => write!(f, "publisher"),
            Role::Searcher => write!(f, "searcher"),
        }
    }
}

/// Lifecycle state of a connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No role active
    Idle,
    /// Visible to searchers, no peer connected yet
    Advertising,
    /// Scanning for a publisher
    Searching,
    /// At least one peer link is established
    Connected { role: Role },
    /// Terminal; the manager cannot be restarted
    ShutDown,
}

impl LinkState {
    /// Short name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            LinkState::Idle => "Idle",
            LinkState::Advertising => "Advertising",
            LinkState::Searching => "Searching",
            LinkState::Connected { role: Role::Publisher } => "Connected(publisher)",
            LinkState::Connected { role: Role::Searcher } => "Connected(searcher)",
            LinkState::ShutDown => "ShutDown",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected { .. })
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
