//! Per-peer virtual socket
//!
//! A `VirtualSocket` wraps one physical link. It owns the receive buffer and
//! the [`ReadQueue`] for that peer and resolves queued reads as byte chunks
//! arrive, however the transport happens to split them. All buffer and queue
//! mutation goes through the socket's own mutex, so different sockets never
//! contend with each other.
//!
//! Reads and writes never block the caller. Outcomes are reported back through
//! the owning manager, which turns them into [`LinkEvent`](crate::LinkEvent)s.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::{LinkError, LinkResult};
use crate::manager::ManagerShared;
use crate::read_queue::{ReadQueue, RequestId};
use crate::transport::Transport;
use crate::types::{PeerAddress, Role, Tag};

/// Lock a std mutex, recovering the guard if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ----------------------------------------------------------------------------
// Socket State
// ----------------------------------------------------------------------------

/// Counters for one socket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    pub bytes_received: u64,
    pub reads_completed: u64,
    pub reads_failed: u64,
}

#[derive(Default)]
struct SocketInner {
    buffer: VecDeque<u8>,
    queue: ReadQueue,
    timers: HashMap<RequestId, JoinHandle<()>>,
    stats: SocketStats,
}

struct WriteRequest {
    data: Vec<u8>,
    timeout: Option<Duration>,
    tag: Tag,
}

// ----------------------------------------------------------------------------
// Virtual Socket
// ----------------------------------------------------------------------------

pub struct VirtualSocket {
    address: PeerAddress,
    local_role: Role,
    connected: watch::Sender<bool>,
    inner: Mutex<SocketInner>,
    writer: mpsc::UnboundedSender<WriteRequest>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    user_data: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    manager: Weak<ManagerShared>,
    transport: Arc<dyn Transport>,
    /// Runtime the socket was created on; read timers run here
    runtime: Handle,
}

impl std::fmt::Debug for VirtualSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualSocket")
            .field("address", &self.address)
            .field("local_role", &self.local_role)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl VirtualSocket {
    /// Create a connected socket and spawn its writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn new(
        address: PeerAddress,
        local_role: Role,
        transport: Arc<dyn Transport>,
        manager: Weak<ManagerShared>,
    ) -> Arc<Self> {
        let (connected, closed) = watch::channel(true);
        let (writer, writes) = mpsc::unbounded_channel();

        let runtime = Handle::current();
        let handle = runtime.spawn(run_writer(
            address.clone(),
            Arc::clone(&transport),
            manager.clone(),
            closed,
            writes,
        ));

        Arc::new(Self {
            address,
            local_role,
            connected,
            inner: Mutex::new(SocketInner::default()),
            writer,
            writer_handle: Mutex::new(Some(handle)),
            user_data: Mutex::new(None),
            manager,
            transport,
            runtime,
        })
    }

    /// Address of the peer behind this socket
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Role this device played when the link was made
    pub fn local_role(&self) -> Role {
        self.local_role
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Bytes received but not yet consumed by a read
    pub fn buffered_len(&self) -> usize {
        lock(&self.inner).buffer.len()
    }

    /// Number of reads waiting in the queue
    pub fn pending_reads(&self) -> usize {
        lock(&self.inner).queue.len()
    }

    pub fn stats(&self) -> SocketStats {
        lock(&self.inner).stats
    }

    // ------------------------------------------------------------------------
    // User Data
    // ------------------------------------------------------------------------

    /// Store caller-owned data on the socket, replacing any previous value
    pub fn set_user_data<T: Any + Send + Sync>(&self, value: T) {
        *lock(&self.user_data) = Some(Box::new(value));
    }

    /// Clone out the user data if it is a `T`
    pub fn user_data<T: Any + Clone>(&self) -> Option<T> {
        lock(&self.user_data)
            .as_ref()
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    pub fn take_user_data(&self) -> Option<Box<dyn Any + Send + Sync>> {
        lock(&self.user_data).take()
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Queue `data` for the transport. Completion is reported with `tag`.
    ///
    /// Writes on one socket reach the transport in submission order.
    pub fn write_data(&self, data: Vec<u8>, timeout: Option<Duration>, tag: Tag) {
        if !self.is_connected() {
            self.report_write(tag, Err(LinkError::not_connected(&self.address)));
            return;
        }

        let request = WriteRequest {
            data,
            timeout: timeout.filter(|t| !t.is_zero()),
            tag,
        };
        if let Err(mpsc::error::SendError(request)) = self.writer.send(request) {
            self.report_write(
                request.tag,
                Err(LinkError::cancelled("socket writer stopped")),
            );
        }
    }

    fn report_write(&self, tag: Tag, result: LinkResult<()>) {
        if let Some(manager) = self.manager.upgrade() {
            manager.return_write(&self.address, tag, result);
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Queue a read of exactly `length` bytes.
    ///
    /// Resolves in the same call when the buffer already satisfies it and no
    /// earlier read is waiting. Zero-length reads are rejected. May be called
    /// from any thread.
    pub fn read_data_to_length(self: &Arc<Self>, length: usize, timeout: Option<Duration>, tag: Tag) {
        if length == 0 {
            self.report_read_failure(tag, LinkError::InvalidReadLength);
            return;
        }

        // Checked under the lock: `close` clears the flag before it drains
        let mut inner = lock(&self.inner);
        if !self.is_connected() {
            drop(inner);
            self.report_read_failure(tag, LinkError::not_connected(&self.address));
            return;
        }
        let id = inner.queue.enqueue(length, timeout, tag);
        self.drain_ready(&mut inner);

        let pending_timeout = inner
            .queue
            .get(id)
            .and_then(|request| request.timeout());
        if let Some(timeout) = pending_timeout {
            let socket = Arc::downgrade(self);
            let timer = self.runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(socket) = socket.upgrade() {
                    socket.expire(id, timeout);
                }
            });
            inner.timers.insert(id, timer);
        }
    }

    /// Feed a chunk received from the transport
    pub(crate) fn deliver(&self, chunk: &[u8]) {
        let mut inner = lock(&self.inner);
        if !self.is_connected() {
            debug!(peer = %self.address, len = chunk.len(), "dropping bytes for closed socket");
            return;
        }
        inner.buffer.extend(chunk.iter().copied());
        inner.stats.bytes_received += chunk.len() as u64;
        self.drain_ready(&mut inner);
    }

    /// Resolve head requests while the buffer satisfies them.
    ///
    /// Completions are reported while the lock is held so concurrent deliveries
    /// cannot reorder them.
    fn drain_ready(&self, inner: &mut SocketInner) {
        while let Some(length) = inner.queue.next_length() {
            if inner.buffer.len() < length {
                break;
            }
            let Some(request) = inner.queue.dequeue() else {
                break;
            };
            if let Some(timer) = inner.timers.remove(&request.id()) {
                timer.abort();
            }
            let data: Vec<u8> = inner.buffer.drain(..length).collect();
            inner.stats.reads_completed += 1;

            if let Some(manager) = self.manager.upgrade() {
                manager.return_read(length, self, request.tag(), data);
            }
        }
    }

    fn expire(&self, id: RequestId, timeout: Duration) {
        let mut inner = lock(&self.inner);
        inner.timers.remove(&id);
        let Some(request) = inner.queue.remove(id) else {
            return;
        };
        inner.stats.reads_failed += 1;
        self.report_read_failure(
            request.tag(),
            LinkError::Timeout {
                duration_ms: duration_ms(timeout),
            },
        );
        // The expired request may have been blocking a satisfiable one
        self.drain_ready(&mut inner);
    }

    fn report_read_failure(&self, tag: Tag, error: LinkError) {
        if let Some(manager) = self.manager.upgrade() {
            manager.return_read_failure(self, tag, error);
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Mark the socket closed and cancel everything pending on it.
    ///
    /// Buffered bytes are discarded; no partial read is ever delivered.
    /// Returns `false` if the socket was already closed.
    pub(crate) fn close(&self, reason: &str) -> bool {
        if !self.connected.send_replace(false) {
            return false;
        }

        let mut inner = lock(&self.inner);
        for (_, timer) in inner.timers.drain() {
            timer.abort();
        }
        let cancelled = inner.queue.drain();
        inner.stats.reads_failed += cancelled.len() as u64;
        inner.buffer.clear();

        for request in cancelled {
            self.report_read_failure(request.tag(), LinkError::cancelled(reason));
        }
        debug!(peer = %self.address, reason, "socket closed");
        true
    }

    /// Wait for the writer to flush cancellations for queued writes
    pub(crate) async fn join_writer(&self) {
        let handle = lock(&self.writer_handle).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(peer = %self.address, "socket writer ended abnormally: {}", e);
            }
        }
    }

    /// Tear down the physical link, cancelling pending reads and writes
    pub async fn disconnect(&self) -> LinkResult<()> {
        self.close("disconnect requested");
        self.join_writer().await;
        self.transport.disconnect(&self.address).await
    }
}

impl Drop for VirtualSocket {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, timer) in inner.timers.drain() {
            timer.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Writer Task
// ----------------------------------------------------------------------------

/// Execute writes one at a time so completions follow submission order
async fn run_writer(
    peer: PeerAddress,
    transport: Arc<dyn Transport>,
    manager: Weak<ManagerShared>,
    mut connected: watch::Receiver<bool>,
    mut writes: mpsc::UnboundedReceiver<WriteRequest>,
) {
    loop {
        let request = tokio::select! {
            biased;
            request = writes.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = wait_closed(&mut connected) => break,
        };

        let result = if !*connected.borrow() {
            Err(LinkError::cancelled("socket disconnected"))
        } else {
            let send = transport.send(&peer, &request.data);
            tokio::select! {
                result = with_timeout(request.timeout, send) => result,
                _ = wait_closed(&mut connected) => Err(LinkError::cancelled("socket disconnected")),
            }
        };

        match &result {
            Ok(()) => debug!(peer = %peer, len = request.data.len(), tag = %request.tag, "write completed"),
            Err(e) => debug!(peer = %peer, tag = %request.tag, "write failed: {}", e),
        }
        if let Some(manager) = manager.upgrade() {
            manager.return_write(&peer, request.tag, result);
        }
    }

    // Anything still queued was submitted before the socket closed
    writes.close();
    while let Ok(request) = writes.try_recv() {
        if let Some(manager) = manager.upgrade() {
            manager.return_write(
                &peer,
                request.tag,
                Err(LinkError::cancelled("socket disconnected")),
            );
        }
    }
}

/// Resolves once the socket is closed or dropped
async fn wait_closed(connected: &mut watch::Receiver<bool>) {
    let _ = connected.wait_for(|up| !*up).await;
}

async fn with_timeout<F>(timeout: Option<Duration>, send: F) -> LinkResult<()>
where
    F: std::future::Future<Output = LinkResult<()>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, send).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout {
                duration_ms: duration_ms(limit),
            }),
        },
        None => send.await,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::events::{LinkEvent, LinkEventReceiver};
    use crate::loopback::{LoopbackNetwork, LoopbackTransport};
    use async_trait::async_trait;

    /// Transport whose sends never complete
    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        fn attach(&self, _events: crate::transport::TransportEventSender) -> LinkResult<()> {
            Ok(())
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn advertise(&self, _identity: &str) -> LinkResult<()> {
            Ok(())
        }

        async fn stop_advertising(&self) -> LinkResult<()> {
            Ok(())
        }

        async fn scan_and_connect(&self, _session_name: &str) -> LinkResult<PeerAddress> {
            Err(LinkError::transport("stalled"))
        }

        async fn send(&self, _peer: &PeerAddress, _data: &[u8]) -> LinkResult<()> {
            std::future::pending().await
        }

        async fn disconnect(&self, _peer: &PeerAddress) -> LinkResult<()> {
            Ok(())
        }

        fn local_address(&self) -> Option<PeerAddress> {
            None
        }

        fn local_name(&self) -> Option<String> {
            None
        }
    }

    fn setup() -> (Arc<ManagerShared>, Arc<VirtualSocket>, LinkEventReceiver) {
        let network = LoopbackNetwork::new();
        setup_with(Arc::new(LoopbackTransport::new(&network, "local", "local")))
    }

    fn setup_with(transport: Arc<dyn Transport>) -> (Arc<ManagerShared>, Arc<VirtualSocket>, LinkEventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let shared = ManagerShared::new(LinkConfig::testing("test"), Arc::clone(&transport), events);
        let socket = VirtualSocket::new(
            PeerAddress::new("peer"),
            Role::Publisher,
            transport,
            Arc::downgrade(&shared),
        );
        (shared, socket, receiver)
    }

    fn completed(event: LinkEvent) -> (usize, Tag, Vec<u8>) {
        match event {
            LinkEvent::ReadCompleted { length, tag, data, .. } => (length, tag, data),
            other => panic!("expected ReadCompleted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_immediate_read_keeps_remainder() {
        let (_shared, socket, mut events) = setup();
        socket.deliver(&[0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);

        socket.read_data_to_length(10, None, Tag(7));

        let (length, tag, data) = completed(events.try_recv().unwrap());
        assert_eq!(length, 10);
        assert_eq!(tag, Tag(7));
        assert_eq!(data, (0u8..10).collect::<Vec<_>>());
        assert_eq!(socket.buffered_len(), 2);
        assert_eq!(socket.pending_reads(), 0);
    }

    #[tokio::test]
    async fn test_reads_complete_in_enqueue_order() {
        let (_shared, socket, mut events) = setup();
        socket.read_data_to_length(3, None, Tag(1));
        socket.read_data_to_length(5, None, Tag(2));

        for byte in 0u8..8 {
            socket.deliver(&[byte]);
        }

        let (len_a, tag_a, data_a) = completed(events.try_recv().unwrap());
        let (len_b, tag_b, data_b) = completed(events.try_recv().unwrap());
        assert_eq!((len_a, tag_a), (3, Tag(1)));
        assert_eq!((len_b, tag_b), (5, Tag(2)));
        assert_eq!(data_a, vec![0, 1, 2]);
        assert_eq!(data_b, vec![3, 4, 5, 6, 7]);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_zero_length_read_rejected() {
        let (_shared, socket, mut events) = setup();
        socket.read_data_to_length(0, None, Tag(3));

        match events.try_recv().unwrap() {
            LinkEvent::ReadFailed { tag, error, .. } => {
                assert_eq!(tag, Tag(3));
                assert_eq!(error, LinkError::InvalidReadLength);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(socket.pending_reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_reported_once() {
        let (_shared, socket, mut events) = setup();
        socket.read_data_to_length(10, Some(Duration::from_millis(100)), Tag(9));

        tokio::time::sleep(Duration::from_millis(150)).await;

        match events.recv().await.unwrap() {
            LinkEvent::ReadFailed { tag, error, .. } => {
                assert_eq!(tag, Tag(9));
                assert_eq!(error, LinkError::Timeout { duration_ms: 100 });
            }
            other => panic!("unexpected event {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(socket.pending_reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_unblocks_following_read() {
        let (_shared, socket, mut events) = setup();
        socket.read_data_to_length(10, Some(Duration::from_millis(50)), Tag(1));
        socket.read_data_to_length(2, None, Tag(2));
        socket.deliver(&[1, 2, 3]);
        assert!(events.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(matches!(
            events.recv().await.unwrap(),
            LinkEvent::ReadFailed { tag: Tag(1), .. }
        ));
        let (length, tag, data) = completed(events.recv().await.unwrap());
        assert_eq!((length, tag), (2, Tag(2)));
        assert_eq!(data, vec![1, 2]);
        assert_eq!(socket.buffered_len(), 1);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_reads() {
        let (_shared, socket, mut events) = setup();
        socket.deliver(&[1, 2]);
        socket.read_data_to_length(4, None, Tag(1));
        socket.read_data_to_length(4, None, Tag(2));

        assert!(socket.close("test"));
        assert!(!socket.close("test"));
        assert!(!socket.is_connected());
        assert!(!socket.is_connected());

        for expected in [Tag(1), Tag(2)] {
            match events.try_recv().unwrap() {
                LinkEvent::ReadFailed { tag, error, .. } => {
                    assert_eq!(tag, expected);
                    assert!(error.is_cancelled());
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(socket.buffered_len(), 0);
    }

    #[tokio::test]
    async fn test_write_on_closed_socket_fails_immediately() {
        let (_shared, socket, mut events) = setup();
        socket.close("test");
        socket.write_data(vec![1, 2, 3], None, Tag(5));

        match events.try_recv().unwrap() {
            LinkEvent::WriteFailed { tag, error, .. } => {
                assert_eq!(tag, Tag(5));
                assert!(matches!(error, LinkError::NotConnected { .. }));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_user_data_slot() {
        let (_shared, socket, _events) = setup();
        assert_eq!(socket.user_data::<u32>(), None);
        socket.set_user_data(42u32);
        assert_eq!(socket.user_data::<u32>(), Some(42));
        assert_eq!(socket.user_data::<String>(), None);
        assert!(socket.take_user_data().is_some());
        assert_eq!(socket.user_data::<u32>(), None);
    }

    #[tokio::test]
    async fn test_timed_read_from_plain_thread() {
        let (_shared, socket, mut events) = setup();

        let reader = Arc::clone(&socket);
        std::thread::spawn(move || {
            reader.read_data_to_length(4, Some(Duration::from_millis(50)), Tag(1));
        })
        .join()
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            LinkEvent::ReadFailed { tag, error, .. } => {
                assert_eq!(tag, Tag(1));
                assert_eq!(error, LinkError::Timeout { duration_ms: 50 });
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(socket.pending_reads(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_racing_reads_ends_every_read() {
        const READS: u64 = 500;
        let (_shared, socket, mut events) = setup();

        let reader = Arc::clone(&socket);
        let reads = std::thread::spawn(move || {
            for tag in 0..READS {
                reader.read_data_to_length(8, None, Tag(tag));
            }
        });
        tokio::task::yield_now().await;
        socket.close("test");
        reads.join().unwrap();

        let mut failed = 0;
        while let Ok(event) = events.try_recv() {
            assert!(matches!(event, LinkEvent::ReadFailed { .. }));
            failed += 1;
        }
        assert_eq!(failed, READS);
        assert_eq!(socket.pending_reads(), 0);
    }

    #[tokio::test]
    async fn test_delivery_after_close_is_dropped() {
        let (_shared, socket, _events) = setup();
        socket.close("test");
        socket.deliver(&[1, 2, 3]);
        assert_eq!(socket.buffered_len(), 0);
        assert_eq!(socket.stats().bytes_received, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout_reported_once() {
        let (_shared, socket, mut events) = setup_with(Arc::new(StalledTransport));
        socket.write_data(vec![1, 2, 3], Some(Duration::from_millis(100)), Tag(6));

        match events.recv().await.unwrap() {
            LinkEvent::WriteFailed { tag, error, .. } => {
                assert_eq!(tag, Tag(6));
                assert_eq!(error, LinkError::Timeout { duration_ms: 100 });
            }
            other => panic!("unexpected event {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_cancels_queued_writes_once() {
        let (_shared, socket, mut events) = setup_with(Arc::new(StalledTransport));
        socket.write_data(vec![1], None, Tag(1));
        socket.write_data(vec![2], None, Tag(2));
        tokio::task::yield_now().await;

        socket.disconnect().await.unwrap();
        assert!(!socket.is_connected());

        let mut cancelled = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                LinkEvent::WriteFailed { tag, error, .. } => {
                    assert!(error.is_cancelled());
                    cancelled.push(tag);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(cancelled, vec![Tag(1), Tag(2)]);

        socket.disconnect().await.unwrap();
        assert!(events.try_recv().is_err());
    }
}
