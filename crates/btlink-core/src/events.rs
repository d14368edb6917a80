//! Events surfaced by the connection manager
//!
//! A closed set of variants delivered over a single channel. Every read or
//! write issued with a tag ends in exactly one completion or failure event
//! carrying that tag.

use tokio::sync::mpsc;

use crate::errors::LinkError;
use crate::types::{PeerAddress, Tag};

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;
pub type LinkEventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

/// Lifecycle, read and write events for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Advertising started
    Published,
    /// Advertising stopped
    PublishingStopped,
    /// An inbound peer connected while publishing
    PeerConnected { peer: PeerAddress },
    /// A peer link went away
    PeerDisconnected { peer: PeerAddress },
    /// The searcher connected to a publisher
    ConnectedToServer { peer: PeerAddress },
    /// Every outbound attempt of a search failed
    SearchFailed { error: LinkError },
    /// A queued read accumulated its requested length
    ReadCompleted {
        peer: PeerAddress,
        length: usize,
        tag: Tag,
        data: Vec<u8>,
    },
    ReadFailed {
        peer: PeerAddress,
        tag: Tag,
        error: LinkError,
    },
    WriteCompleted { peer: PeerAddress, tag: Tag },
    WriteFailed {
        peer: PeerAddress,
        tag: Tag,
        error: LinkError,
    },
    /// The publisher accepted its last allowed inbound link
    MaxConnectionsReached { max: usize },
    /// The radio reported a socket-level failure; restarting it is advised
    TransportReset { reason: String },
}

impl LinkEvent {
    /// Correlation tag for read/write events
    pub fn tag(&self) -> Option<Tag> {
        match self {
            LinkEvent::ReadCompleted { tag, .. }
            | LinkEvent::ReadFailed { tag, .. }
            | LinkEvent::WriteCompleted { tag, .. }
            | LinkEvent::WriteFailed { tag, .. } => Some(*tag),
            _ => None,
        }
    }

    /// Peer the event refers to, if any
    pub fn peer(&self) -> Option<&PeerAddress> {
        match self {
            LinkEvent::PeerConnected { peer }
            | LinkEvent::PeerDisconnected { peer }
            | LinkEvent::ConnectedToServer { peer }
            | LinkEvent::ReadCompleted { peer, .. }
            | LinkEvent::ReadFailed { peer, .. }
            | LinkEvent::WriteCompleted { peer, .. }
            | LinkEvent::WriteFailed { peer, .. } => Some(peer),
            _ => None,
        }
    }

    /// Whether this event terminates a tagged operation
    pub fn is_terminal(&self) -> bool {
        self.tag().is_some()
    }
}
