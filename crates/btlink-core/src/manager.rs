//! Connection manager
//!
//! Owns every [`VirtualSocket`] keyed by peer address, drives the
//! publish/search role state machine and turns transport notifications and
//! socket completions into [`LinkEvent`]s.
//!
//! ```text
//!  Idle ──start_publishing──▶ Advertising ──inbound peer──▶ Connected(publisher)
//!   │ ▲                          │                                │
//!   │ └──────stop_publishing─────┘◀──────last peer leaves─────────┘
//!   │
//!   └──start_searching──▶ Searching ──connected──▶ Connected(searcher)
//!                            │                         │
//!   Idle ◀──stop/failed──────┘◀──────server lost───────┘
//!
//!  any ──disconnect()──▶ Idle        any ──shutdown()──▶ ShutDown (terminal)
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use smallvec::SmallVec;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::errors::{LinkError, LinkResult};
use crate::events::{LinkEvent, LinkEventReceiver, LinkEventSender};
use crate::socket::{lock, VirtualSocket};
use crate::transport::{advertised_name, Transport, TransportEvent, TransportEventReceiver};
use crate::types::{LinkState, PeerAddress, Role, Tag};

type SocketMap = HashMap<PeerAddress, Arc<VirtualSocket>>;

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

/// State shared between the manager handle, its background tasks and sockets
///
/// Sockets only hold a `Weak` reference to this, so dropping the manager
/// releases everything.
pub(crate) struct ManagerShared {
    config: LinkConfig,
    transport: Arc<dyn Transport>,
    events: LinkEventSender,
    state: Mutex<LinkState>,
    sockets: RwLock<SocketMap>,
    server: Mutex<Option<Arc<VirtualSocket>>>,
    /// Links reported gone while searching, before a socket existed for them
    lost_while_searching: Mutex<HashSet<PeerAddress>>,
    accepting: AtomicBool,
}

impl ManagerShared {
    pub(crate) fn new(
        config: LinkConfig,
        transport: Arc<dyn Transport>,
        events: LinkEventSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            events,
            state: Mutex::new(LinkState::Idle),
            sockets: RwLock::new(HashMap::new()),
            server: Mutex::new(None),
            lost_while_searching: Mutex::new(HashSet::new()),
            accepting: AtomicBool::new(false),
        })
    }

    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            debug!("link event receiver dropped");
        }
    }

    fn state(&self) -> LinkState {
        *lock(&self.state)
    }

    fn set_state(&self, next: LinkState) {
        let mut state = lock(&self.state);
        if *state != next {
            info!("link state {} -> {}", *state, next);
            *state = next;
        }
    }

    // ------------------------------------------------------------------------
    // Completion Sink
    // ------------------------------------------------------------------------

    /// Single sink for read completions from every socket
    pub(crate) fn return_read(&self, length: usize, socket: &VirtualSocket, tag: Tag, data: Vec<u8>) {
        debug!(peer = %socket.address(), length, tag = %tag, "read completed");
        self.emit(LinkEvent::ReadCompleted {
            peer: socket.address().clone(),
            length,
            tag,
            data,
        });
    }

    pub(crate) fn return_read_failure(&self, socket: &VirtualSocket, tag: Tag, error: LinkError) {
        debug!(peer = %socket.address(), tag = %tag, "read failed: {}", error);
        self.emit(LinkEvent::ReadFailed {
            peer: socket.address().clone(),
            tag,
            error,
        });
    }

    pub(crate) fn return_write(&self, peer: &PeerAddress, tag: Tag, result: LinkResult<()>) {
        let peer = peer.clone();
        match result {
            Ok(()) => self.emit(LinkEvent::WriteCompleted { peer, tag }),
            Err(error) => self.emit(LinkEvent::WriteFailed { peer, tag, error }),
        }
    }

    fn fail_read(&self, peer: &PeerAddress, tag: Tag, error: LinkError) {
        debug!(peer = %peer, tag = %tag, "read failed: {}", error);
        self.emit(LinkEvent::ReadFailed {
            peer: peer.clone(),
            tag,
            error,
        });
    }

    // ------------------------------------------------------------------------
    // Socket Map
    // ------------------------------------------------------------------------

    /// Insert a fresh socket for `peer`, cancelling any socket it replaces
    fn install_socket(self: &Arc<Self>, sockets: &mut SocketMap, peer: &PeerAddress, role: Role) -> Arc<VirtualSocket> {
        let socket = VirtualSocket::new(
            peer.clone(),
            role,
            Arc::clone(&self.transport),
            Arc::downgrade(self),
        );
        if let Some(previous) = sockets.insert(peer.clone(), Arc::clone(&socket)) {
            info!(peer = %peer, "reconnect replaces existing socket");
            previous.close("replaced by reconnect");
        }
        socket
    }

    /// Recompute the connected sub-state after a socket went away
    fn settle_state(&self, sockets: &SocketMap) {
        let mut state = lock(&self.state);
        let current = *state;
        let next = match current {
            LinkState::Connected { role: Role::Publisher }
                if !sockets.values().any(|s| s.local_role() == Role::Publisher) =>
            {
                if self.accepting.load(Ordering::SeqCst) {
                    LinkState::Advertising
                } else {
                    LinkState::Idle
                }
            }
            LinkState::Connected { role: Role::Searcher } if lock(&self.server).is_none() => {
                LinkState::Idle
            }
            current => current,
        };
        if *state != next {
            info!("link state {} -> {}", *state, next);
            *state = next;
        }
    }

    // ------------------------------------------------------------------------
    // Transport Events
    // ------------------------------------------------------------------------

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::InboundConnection { peer } => self.on_inbound(peer).await,
            TransportEvent::BytesReceived { peer, data } => {
                let sockets = self.sockets.read().await;
                match sockets.get(&peer) {
                    Some(socket) => {
                        debug!(peer = %peer, len = data.len(), "bytes received");
                        socket.deliver(&data);
                    }
                    None => debug!(peer = %peer, len = data.len(), "bytes for unknown peer dropped"),
                }
            }
            TransportEvent::Disconnected { peer } => self.on_disconnected(peer).await,
            TransportEvent::SocketFailure { reason } => {
                warn!("transport socket failure: {}", reason);
                self.emit(LinkEvent::TransportReset { reason });
            }
        }
    }

    async fn on_inbound(self: &Arc<Self>, peer: PeerAddress) {
        let state = self.state();
        let publishing = matches!(
            state,
            LinkState::Advertising | LinkState::Connected { role: Role::Publisher }
        );
        if !publishing || !self.accepting.load(Ordering::SeqCst) {
            warn!(peer = %peer, "rejecting inbound connection in state {}", state);
            self.reject(&peer).await;
            return;
        }

        let max = self.config.max_connections;
        let mut sockets = self.sockets.write().await;
        let inbound = sockets
            .iter()
            .filter(|(address, socket)| *address != &peer && socket.local_role() == Role::Publisher)
            .count();
        if inbound >= max {
            drop(sockets);
            warn!(peer = %peer, "rejecting inbound connection: {} already connected", inbound);
            self.reject(&peer).await;
            return;
        }

        self.install_socket(&mut sockets, &peer, Role::Publisher);
        drop(sockets);

        info!(peer = %peer, "peer connected");
        self.set_state(LinkState::Connected { role: Role::Publisher });
        self.emit(LinkEvent::PeerConnected { peer });

        if inbound + 1 >= max && self.accepting.swap(false, Ordering::SeqCst) {
            warn!("maximum connections reached ({})", max);
            if let Err(e) = self.transport.stop_advertising().await {
                error!("failed to stop advertising: {}", e);
            }
            self.emit(LinkEvent::MaxConnectionsReached { max });
        }
    }

    async fn reject(&self, peer: &PeerAddress) {
        if let Err(e) = self.transport.disconnect(peer).await {
            debug!(peer = %peer, "failed to tear down rejected link: {}", e);
        }
    }

    async fn on_disconnected(&self, peer: PeerAddress) {
        let mut sockets = self.sockets.write().await;
        let Some(socket) = sockets.remove(&peer) else {
            if self.state() == LinkState::Searching {
                debug!(peer = %peer, "link lost before server socket was installed");
                lock(&self.lost_while_searching).insert(peer);
            } else {
                debug!(peer = %peer, "disconnect for unknown peer");
            }
            return;
        };
        socket.close("peer disconnected");
        {
            let mut server = lock(&self.server);
            if server.as_ref().is_some_and(|s| Arc::ptr_eq(s, &socket)) {
                *server = None;
            }
        }
        self.settle_state(&sockets);
        drop(sockets);

        info!(peer = %peer, "peer disconnected");
        self.emit(LinkEvent::PeerDisconnected { peer });
    }

    /// Install the server socket for a fresh outbound link.
    ///
    /// Returns whether the socket was installed. Runs under the socket map
    /// lock so a disconnect for `peer` is either seen here or lands on the
    /// installed socket.
    async fn on_server_connected(self: &Arc<Self>, peer: PeerAddress) -> bool {
        if self.state() != LinkState::Searching {
            info!(peer = %peer, "search stopped before connect completed");
            self.reject(&peer).await;
            return false;
        }

        let mut sockets = self.sockets.write().await;
        if lock(&self.lost_while_searching).remove(&peer) {
            drop(sockets);
            warn!(peer = %peer, "server dropped the link before it was installed");
            self.reject(&peer).await;
            return false;
        }
        let socket = self.install_socket(&mut sockets, &peer, Role::Searcher);
        *lock(&self.server) = Some(socket);

        info!(peer = %peer, "connected to server");
        self.set_state(LinkState::Connected { role: Role::Searcher });
        self.emit(LinkEvent::ConnectedToServer { peer });
        true
    }

    async fn run_search(self: Arc<Self>) {
        let attempts = self.config.connect_attempts;
        let mut last_error = LinkError::transport("no connection attempt made");

        for attempt in 1..=attempts {
            if self.state() != LinkState::Searching {
                return;
            }
            match self.transport.scan_and_connect(&self.config.session_name).await {
                Ok(peer) => {
                    if self.on_server_connected(peer.clone()).await {
                        return;
                    }
                    last_error = LinkError::transport(format!("link to {} lost while connecting", peer));
                }
                Err(e) => {
                    warn!("connect attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.connect_retry_delay).await;
            }
        }

        let mut state = lock(&self.state);
        if *state == LinkState::Searching {
            *state = LinkState::Idle;
            drop(state);
            error!("search failed: {}", last_error);
            self.emit(LinkEvent::SearchFailed { error: last_error });
        }
    }

    /// Close and forget every socket, returning how many were torn down
    async fn teardown_sockets(&self, reason: &str) -> usize {
        let drained: Vec<Arc<VirtualSocket>> = {
            let mut sockets = self.sockets.write().await;
            *lock(&self.server) = None;
            sockets.drain().map(|(_, socket)| socket).collect()
        };

        for socket in &drained {
            socket.close(reason);
            socket.join_writer().await;
            if let Err(e) = self.transport.disconnect(socket.address()).await {
                warn!(peer = %socket.address(), "transport disconnect failed: {}", e);
            }
            self.emit(LinkEvent::PeerDisconnected {
                peer: socket.address().clone(),
            });
        }
        drained.len()
    }
}

async fn pump_transport_events(shared: Weak<ManagerShared>, mut events: TransportEventReceiver) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.handle_transport_event(event).await;
    }
    debug!("transport event pump stopped");
}

// ----------------------------------------------------------------------------
// Connection Manager
// ----------------------------------------------------------------------------

/// Session orchestrator over one transport
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
    event_receiver: Option<LinkEventReceiver>,
    pump: JoinHandle<()>,
    search: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager over `transport` and start consuming its notifications.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: LinkConfig, transport: Arc<dyn Transport>) -> LinkResult<Self> {
        config.validate()?;

        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let (transport_sender, transport_receiver) = mpsc::unbounded_channel();
        transport.attach(transport_sender)?;

        let shared = ManagerShared::new(config, transport, event_sender);
        let pump = tokio::spawn(pump_transport_events(
            Arc::downgrade(&shared),
            transport_receiver,
        ));

        Ok(Self {
            shared,
            event_receiver: Some(event_receiver),
            pump,
            search: Mutex::new(None),
        })
    }

    /// Take the event receiver (only once)
    pub fn take_event_receiver(&mut self) -> Option<LinkEventReceiver> {
        self.event_receiver.take()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    fn ensure_running(&self) -> LinkResult<LinkState> {
        match self.shared.state() {
            LinkState::ShutDown => Err(LinkError::ShutDown),
            state => Ok(state),
        }
    }

    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    /// Become discoverable and accept inbound peers
    pub async fn start_publishing(&self) -> LinkResult<()> {
        {
            let mut state = lock(&self.shared.state);
            let current = *state;
            match current {
                LinkState::Idle => {
                    info!("link state {} -> {}", current, LinkState::Advertising);
                    *state = LinkState::Advertising;
                }
                LinkState::Advertising => return Ok(()),
                LinkState::ShutDown => return Err(LinkError::ShutDown),
                other => {
                    return Err(LinkError::InvalidState {
                        expected: LinkState::Idle.to_string(),
                        actual: other.to_string(),
                    })
                }
            }
        }

        let local_name = self.shared.transport.local_name().unwrap_or_default();
        let identity = advertised_name(&local_name, &self.shared.config.session_name);

        self.shared.accepting.store(true, Ordering::SeqCst);
        if let Err(e) = self.shared.transport.advertise(&identity).await {
            self.shared.accepting.store(false, Ordering::SeqCst);
            self.shared.set_state(LinkState::Idle);
            return Err(e);
        }

        info!("publishing as {}", identity);
        self.shared.emit(LinkEvent::Published);
        Ok(())
    }

    /// Stop being discoverable; already connected peers stay connected
    pub async fn stop_publishing(&self) -> LinkResult<()> {
        let state = self.ensure_running()?;
        let publishing = matches!(
            state,
            LinkState::Advertising | LinkState::Connected { role: Role::Publisher }
        );
        if !publishing {
            return Err(LinkError::InvalidState {
                expected: LinkState::Advertising.to_string(),
                actual: state.to_string(),
            });
        }

        if self.shared.accepting.swap(false, Ordering::SeqCst) {
            self.shared.transport.stop_advertising().await?;
        }
        if self.shared.state() == LinkState::Advertising {
            self.shared.set_state(LinkState::Idle);
        }

        info!("publishing stopped");
        self.shared.emit(LinkEvent::PublishingStopped);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Searching
    // ------------------------------------------------------------------------

    /// Scan for a publisher of this session and connect to it in the background.
    ///
    /// Success is reported as [`LinkEvent::ConnectedToServer`], exhaustion of
    /// all attempts as [`LinkEvent::SearchFailed`].
    pub fn start_searching(&self) -> LinkResult<()> {
        {
            let mut state = lock(&self.shared.state);
            let current = *state;
            match current {
                LinkState::Idle => {
                    *state = LinkState::Searching;
                    lock(&self.shared.lost_while_searching).clear();
                }
                LinkState::Searching => return Ok(()),
                LinkState::ShutDown => return Err(LinkError::ShutDown),
                other => {
                    return Err(LinkError::InvalidState {
                        expected: LinkState::Idle.to_string(),
                        actual: other.to_string(),
                    })
                }
            }
        }

        info!("searching for session {}", self.shared.config.session_name);
        let handle = tokio::spawn(Arc::clone(&self.shared).run_search());
        if let Some(previous) = lock(&self.search).replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Abandon an in-progress search
    pub fn stop_searching(&self) -> LinkResult<()> {
        let mut state = lock(&self.shared.state);
        if *state != LinkState::Searching {
            return Err(LinkError::InvalidState {
                expected: LinkState::Searching.to_string(),
                actual: state.to_string(),
            });
        }
        *state = LinkState::Idle;
        drop(state);

        if let Some(handle) = lock(&self.search).take() {
            handle.abort();
        }
        info!("search stopped");
        Ok(())
    }

    /// Whether the upstream server socket exists and is connected
    pub fn is_connected_to_server(&self) -> bool {
        lock(&self.shared.server)
            .as_ref()
            .is_some_and(|socket| socket.is_connected())
    }

    /// Address of the upstream server, if connected as a searcher
    pub fn server_address(&self) -> Option<PeerAddress> {
        lock(&self.shared.server)
            .as_ref()
            .map(|socket| socket.address().clone())
    }

    // ------------------------------------------------------------------------
    // Identity and Lookup
    // ------------------------------------------------------------------------

    /// Whether the underlying radio is present and usable
    pub async fn is_available(&self) -> bool {
        self.shared.transport.is_available().await
    }

    /// This device's own address; `None` until the transport has one
    pub fn get_address(&self) -> Option<PeerAddress> {
        self.shared.transport.local_address()
    }

    /// This device's name as exposed by the transport
    pub fn get_name(&self) -> Option<String> {
        self.shared.transport.local_name()
    }

    /// Addresses of all connected peers
    pub async fn connections(&self) -> SmallVec<[PeerAddress; 8]> {
        let sockets = self.shared.sockets.read().await;
        let mut peers: SmallVec<[PeerAddress; 8]> = sockets
            .values()
            .filter(|socket| socket.is_connected())
            .map(|socket| socket.address().clone())
            .collect();
        peers.sort();
        peers
    }

    /// Socket for `peer`, if one is live
    pub async fn socket(&self, peer: &PeerAddress) -> Option<Arc<VirtualSocket>> {
        self.shared.sockets.read().await.get(peer).cloned()
    }

    // ------------------------------------------------------------------------
    // Reads and Writes
    // ------------------------------------------------------------------------

    /// Queue a read on `peer`'s socket; outcome arrives as an event tagged `tag`
    pub async fn read_data_to_length(
        &self,
        peer: &PeerAddress,
        length: usize,
        timeout: Option<Duration>,
        tag: Tag,
    ) {
        if self.shared.state() == LinkState::ShutDown {
            self.shared.fail_read(peer, tag, LinkError::cancelled("manager shut down"));
            return;
        }
        let sockets = self.shared.sockets.read().await;
        match sockets.get(peer) {
            Some(socket) => socket.read_data_to_length(length, timeout, tag),
            None => self.shared.fail_read(peer, tag, LinkError::unknown_peer(peer)),
        }
    }

    /// Queue a write to `peer`; outcome arrives as an event tagged `tag`
    pub async fn write_data(&self, peer: &PeerAddress, data: Vec<u8>, timeout: Option<Duration>, tag: Tag) {
        if self.shared.state() == LinkState::ShutDown {
            self.shared
                .return_write(peer, tag, Err(LinkError::cancelled("manager shut down")));
            return;
        }
        // Held across the dispatch so a concurrent disconnect cannot interleave
        let sockets = self.shared.sockets.read().await;
        match sockets.get(peer) {
            Some(socket) => socket.write_data(data, timeout, tag),
            None => self
                .shared
                .return_write(peer, tag, Err(LinkError::unknown_peer(peer))),
        }
    }

    /// Send a text message to one device
    pub async fn send_device_message(&self, device: &PeerAddress, message: &str, tag: Tag) {
        debug!(peer = %device, len = message.len(), "sending device message");
        let timeout = self.shared.config.default_write_timeout;
        self.write_data(device, message.as_bytes().to_vec(), timeout, tag)
            .await;
    }

    /// Send a text message to every connected peer; returns the number of recipients.
    ///
    /// Each recipient reports its own write outcome under the shared `tag`.
    pub async fn broadcast_message(&self, message: &str, tag: Tag) -> usize {
        if self.shared.state() == LinkState::ShutDown {
            return 0;
        }
        let timeout = self.shared.config.default_write_timeout;
        let sockets = self.shared.sockets.read().await;
        let mut recipients = 0;
        for socket in sockets.values().filter(|socket| socket.is_connected()) {
            socket.write_data(message.as_bytes().to_vec(), timeout, tag);
            recipients += 1;
        }
        debug!(recipients, "broadcast message queued");
        recipients
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Tear down the link to a single peer
    pub async fn disconnect_peer(&self, peer: &PeerAddress) -> LinkResult<()> {
        self.ensure_running()?;
        let socket = {
            let mut sockets = self.shared.sockets.write().await;
            let socket = sockets
                .remove(peer)
                .ok_or_else(|| LinkError::unknown_peer(peer))?;
            {
                let mut server = lock(&self.shared.server);
                if server.as_ref().is_some_and(|s| Arc::ptr_eq(s, &socket)) {
                    *server = None;
                }
            }
            self.shared.settle_state(&sockets);
            socket
        };

        let result = socket.disconnect().await;
        self.shared.emit(LinkEvent::PeerDisconnected { peer: peer.clone() });
        result
    }

    /// Tear down every socket, stop advertising and searching, and return to Idle
    pub async fn disconnect(&self) -> LinkResult<()> {
        self.ensure_running()?;
        self.stop_roles().await;
        let closed = self.shared.teardown_sockets("disconnect requested").await;
        self.shared.set_state(LinkState::Idle);
        info!("disconnected {} socket(s)", closed);
        Ok(())
    }

    /// Release everything. Every pending read and write receives exactly one
    /// `Cancelled` failure; the manager cannot be restarted afterwards.
    pub async fn shutdown(&self) -> LinkResult<()> {
        if self.shared.state() == LinkState::ShutDown {
            return Ok(());
        }
        self.stop_roles().await;
        self.shared.set_state(LinkState::ShutDown);
        let closed = self.shared.teardown_sockets("shutdown").await;
        self.pump.abort();
        info!("connection manager shut down ({} socket(s) closed)", closed);
        Ok(())
    }

    async fn stop_roles(&self) {
        if let Some(handle) = lock(&self.search).take() {
            handle.abort();
        }
        if self.shared.accepting.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.shared.transport.stop_advertising().await {
                warn!("failed to stop advertising: {}", e);
            }
            self.shared.emit(LinkEvent::PublishingStopped);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.pump.abort();
        if let Some(handle) = lock(&self.search).take() {
            handle.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
