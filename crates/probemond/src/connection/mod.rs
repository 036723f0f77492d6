//! Peer connections.
//!
//! A [`Connection`] is one bidirectional session with another probemon
//! process over TCP, framed as newline-delimited JSON.
//!
//! ```text
//! pending ──▶ handshaking ──▶ connected ──▶ disconnected
//!    │             │                           ▲
//!    └─────────────┴───────────────────────────┘ (dial failure, timeout,
//!                                                 transport error, manual)
//! ```
//!
//! Both sides send `connection:info` on entering `handshaking`; the peer's
//! info moves the connection to `connected`. Only `connection:info` is
//! processed before that point. Afterwards the reader task dispatches
//! pings, acks and `probe:change:<id>` pushes inline, in arrival order.
//! Inbound probe requests go through a per-connection queue: controls and
//! disconnects run one at a time in the order they were read, and only
//! `probe:connect` resolution runs on its own task.
//!
//! A line longer than [`MAX_FRAME_SIZE`] is never buffered; it ends the
//! session as a transport error.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Transport errors move the connection to `disconnected`; they never
//!   propagate out of the reader task

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use probemon_core::{ProbeError, ProbeId, ProbeResult};
use probemon_protocol::{
    ack_outcome, decode, encode, ConnectionInfo, Frame, FrameError, ProtocolVersion,
    CONNECTION_INFO, CONNECTION_PING, CONNECTION_PONG, MAX_FRAME_SIZE, PROBE_CONNECT,
    PROBE_CONTROL, PROBE_DISCONNECT,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use futures_util::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::router::{RemoteProbeCache, Router};

mod events;
mod inbound;

pub use events::{EventError, EventHandler, EventTable};
use inbound::InboundRequest;
pub(crate) use inbound::IncomingMonitor;

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection number.
pub type ConnectionId = u64;

/// Invoked by the reader task with the outcome of an acked request.
type AckCallback = Box<dyn FnOnce(ProbeResult<Value>) + Send>;

// ============================================================================
// Types
// ============================================================================

/// Lifecycle state. Ordered: a later state never moves back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Pending,
    Handshaking,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Dial target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called
    Manual,
    /// The process is shutting down
    Shutdown,
    /// The peer closed the transport
    TransportClosed,
    /// Dial, read or write failed
    TransportError(String),
    /// The handshake did not complete
    HandshakeFailed(String),
    /// The peer speaks an incompatible protocol major version
    VersionMismatch,
    /// The peer is this very process
    SelfConnection,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
            Self::TransportClosed => "transport_closed",
            Self::TransportError(_) => "transport_error",
            Self::HandshakeFailed(_) => "handshake_failed",
            Self::VersionMismatch => "version_mismatch",
            Self::SelfConnection => "self_connection",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportError(detail) | Self::HandshakeFailed(detail) => {
                write!(f, "{}: {detail}", self.as_str())
            }
            _ => f.write_str(self.as_str()),
        }
    }
}

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Write timed out")]
    WriteTimeout,

    #[error("Connection closed")]
    Closed,
}

impl From<ConnectionError> for ProbeError {
    fn from(e: ConnectionError) -> Self {
        ProbeError::Connection(e.to_string())
    }
}

/// Introspection view of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub endpoint: Option<String>,
    pub remote: Option<ConnectionInfo>,
    pub gateway: bool,
    pub firewall: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnect_reason: Option<String>,
    pub incoming_probes: usize,
    pub remote_probes: usize,
}

// ============================================================================
// Connection
// ============================================================================

/// One session with a peer process.
///
/// Cheap to clone; all clones refer to the same session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// Non-owning reference to a [`Connection`].
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

struct ConnectionInner {
    id: ConnectionId,
    endpoint: Option<Endpoint>,
    local: ConnectionInfo,
    gateway: AtomicBool,
    firewall: AtomicBool,
    state: watch::Sender<ConnectionState>,
    remote: RwLock<Option<ConnectionInfo>>,
    writer: AsyncMutex<Option<BufWriter<OwnedWriteHalf>>>,
    pending: Mutex<HashMap<u64, AckCallback>>,
    next_ack: AtomicU64,
    events: EventTable,
    remote_probes: RemoteProbeCache,
    incoming: Mutex<HashMap<ProbeId, IncomingMonitor>>,
    cancel: CancellationToken,
    connected_at: Mutex<Option<DateTime<Utc>>>,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    fn new(router: &Router, endpoint: Option<Endpoint>, gateway: bool, firewall: bool) -> Self {
        let (state, _) = watch::channel(ConnectionState::Pending);
        let local = router
            .identity()
            .connection_info(router.classes().names(), gateway, firewall);

        Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                endpoint,
                local,
                gateway: AtomicBool::new(gateway),
                firewall: AtomicBool::new(firewall),
                state,
                remote: RwLock::new(None),
                writer: AsyncMutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_ack: AtomicU64::new(1),
                events: EventTable::new(),
                remote_probes: RemoteProbeCache::default(),
                incoming: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                connected_at: Mutex::new(None),
                disconnect_reason: Mutex::new(None),
            }),
        }
    }

    /// Dials `endpoint` in the background.
    ///
    /// Returns immediately in the `pending` state; watch
    /// [`Connection::subscribe_state`] or call [`Connection::wait_settled`]
    /// to learn the outcome.
    pub fn dial(router: &Router, endpoint: Endpoint, gateway: bool) -> Self {
        let conn = Self::new(router, Some(endpoint.clone()), gateway, false);
        let task_conn = conn.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let limit = router.config().connect_timeout();
            let dial = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
            match timeout(limit, dial).await {
                Ok(Ok(stream)) => task_conn.run(stream, router).await,
                Ok(Err(e)) => {
                    debug!(connection = task_conn.id(), %endpoint, error = %e, "Dial failed");
                    task_conn.disconnect(DisconnectReason::TransportError(e.to_string()));
                }
                Err(_) => {
                    debug!(connection = task_conn.id(), %endpoint, "Dial timed out");
                    task_conn.disconnect(DisconnectReason::TransportError(format!(
                        "connect timed out after {limit:?}"
                    )));
                }
            }
        });

        conn
    }

    /// Wraps an accepted stream and starts the handshake.
    pub fn accept(router: &Router, stream: TcpStream, firewall: bool) -> Self {
        let conn = Self::new(router, None, false, firewall);
        tokio::spawn(conn.clone().run(stream, router.clone()));
        conn
    }

    /// Handshakes, then reads frames until the session ends.
    async fn run(self, stream: TcpStream, router: Router) {
        if self.is_disconnected() {
            return;
        }

        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        *self.inner.writer.lock().await = Some(BufWriter::new(write_half));

        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Pending {
                *state = ConnectionState::Handshaking;
                true
            } else {
                false
            }
        });
        debug!(connection = self.id(), peer = ?peer, "Handshaking");

        let info = match serde_json::to_value(&self.inner.local) {
            Ok(info) => info,
            Err(e) => {
                self.disconnect(DisconnectReason::HandshakeFailed(e.to_string()));
                return;
            }
        };
        if let Err(e) = self.emit(CONNECTION_INFO, info).await {
            debug!(connection = self.id(), error = %e, "Failed to send connection info");
            return;
        }

        self.spawn_handshake_timer(router.config().connect_timeout());
        let lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_FRAME_SIZE));
        self.read_frames(lines, &router).await;
    }

    fn spawn_handshake_timer(&self, limit: Duration) {
        let conn = self.clone();
        tokio::spawn(async move {
            if conn.wait_settled(limit).await < ConnectionState::Connected {
                conn.disconnect(DisconnectReason::HandshakeFailed(format!(
                    "no connection info within {limit:?}"
                )));
            }
        });
    }

    async fn read_frames(&self, mut lines: FramedRead<OwnedReadHalf, LinesCodec>, router: &Router) {
        let (requests, queue) = mpsc::unbounded_channel();
        tokio::spawn(inbound::serve_requests(self.clone(), router.clone(), queue));

        loop {
            let next = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                next = lines.next() => next,
            };

            let line = match next {
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(connection = self.id(), max = MAX_FRAME_SIZE, "Oversized frame, closing");
                    self.disconnect(DisconnectReason::TransportError(format!(
                        "frame exceeds {MAX_FRAME_SIZE} bytes"
                    )));
                    break;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    self.disconnect(DisconnectReason::TransportError(e.to_string()));
                    break;
                }
                None => {
                    self.disconnect(DisconnectReason::TransportClosed);
                    break;
                }
            };

            match decode(&line) {
                Ok(frame) => self.handle_frame(frame, router, &requests),
                Err(e) => warn!(connection = self.id(), error = %e, "Dropping malformed frame"),
            }
        }

        debug!(connection = self.id(), "Reader stopped");
    }

    fn handle_frame(
        &self,
        frame: Frame,
        router: &Router,
        requests: &mpsc::UnboundedSender<InboundRequest>,
    ) {
        let (name, payload, ack) = match frame {
            Frame::Ack { id, result, error } => {
                self.resolve_ack(id, ack_outcome(result, error));
                return;
            }
            Frame::Event { name, payload, ack } => (name, payload, ack),
        };

        if self.state() != ConnectionState::Connected {
            if name == CONNECTION_INFO {
                self.handle_info(payload, router);
            } else {
                debug!(connection = self.id(), event = %name, "Ignoring event before handshake");
                if let Some(id) = ack {
                    self.spawn_ack(
                        id,
                        Err(ProbeError::Connection("handshake not complete".to_string())),
                    );
                }
            }
            return;
        }

        match name.as_str() {
            CONNECTION_INFO => debug!(connection = self.id(), "Duplicate connection info ignored"),
            CONNECTION_PING => match ack {
                Some(id) => self.spawn_ack(id, Ok(Value::from("pong"))),
                None => {
                    let conn = self.clone();
                    tokio::spawn(async move {
                        let _ = conn.emit(CONNECTION_PONG, Value::Null).await;
                    });
                }
            },
            CONNECTION_PONG => debug!(connection = self.id(), "Pong received"),
            PROBE_CONNECT | PROBE_DISCONNECT | PROBE_CONTROL => {
                if requests.send(InboundRequest { name, payload, ack }).is_err() {
                    debug!(connection = self.id(), "Request queue closed");
                }
            }
            _ => {
                if !self.inner.events.dispatch(&name, payload) {
                    debug!(connection = self.id(), event = %name, "No handler bound");
                }
            }
        }
    }

    fn handle_info(&self, payload: Value, router: &Router) {
        let info: ConnectionInfo = match serde_json::from_value(payload) {
            Ok(info) => info,
            Err(e) => {
                self.disconnect(DisconnectReason::HandshakeFailed(e.to_string()));
                return;
            }
        };

        let Some(protocol) = ProtocolVersion::CURRENT.negotiate(&info.protocol_version) else {
            warn!(
                connection = self.id(),
                peer_version = %info.protocol_version,
                local_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.disconnect(DisconnectReason::VersionMismatch);
            return;
        };

        if router.identity().is_same_process(&info) {
            debug!(connection = self.id(), "Connected to self, dropping");
            self.disconnect(DisconnectReason::SelfConnection);
            return;
        }

        if info.gateway {
            self.inner.gateway.store(true, Ordering::Relaxed);
        }

        info!(
            connection = self.id(),
            host = %info.host_name,
            app = %info.app_name,
            instance = %info.app_instance,
            pid = info.pid,
            %protocol,
            classes = info.probe_classes.len(),
            "Peer connected"
        );

        *self
            .inner
            .remote
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(info);
        *lock(&self.inner.connected_at) = Some(Utc::now());

        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Handshaking {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
    }

    fn resolve_ack(&self, id: u64, outcome: ProbeResult<Value>) {
        let callback = lock(&self.inner.pending).remove(&id);
        match callback {
            Some(callback) => callback(outcome),
            None => debug!(connection = self.id(), ack = id, "Ack for unknown request"),
        }
    }

    fn spawn_ack(&self, id: u64, outcome: ProbeResult<Value>) {
        let conn = self.clone();
        tokio::spawn(async move {
            let _ = conn.send_frame(Frame::ack(id, outcome)).await;
        });
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Writes one frame.
    ///
    /// A failed or timed-out write disconnects the session.
    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), ConnectionError> {
        if self.is_disconnected() {
            return Err(ConnectionError::Closed);
        }
        let line = encode(&frame)?;

        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(ConnectionError::Closed)?;
        let written = timeout(WRITE_TIMEOUT, async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        })
        .await;
        drop(guard);

        match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.disconnect(DisconnectReason::TransportError(e.to_string()));
                Err(ConnectionError::Io(e))
            }
            Err(_) => {
                self.disconnect(DisconnectReason::TransportError(
                    "write timed out".to_string(),
                ));
                Err(ConnectionError::WriteTimeout)
            }
        }
    }

    /// Sends a fire-and-forget event.
    pub async fn emit(&self, name: &str, payload: Value) -> Result<(), ConnectionError> {
        self.send_frame(Frame::event(name, payload)).await
    }

    /// Sends an event and waits for the peer's ack.
    ///
    /// # Errors
    ///
    /// The peer's error, or `ProbeError::Connection` if the session is not
    /// connected or ends before the ack arrives.
    pub async fn request(&self, name: &str, payload: Value) -> ProbeResult<Value> {
        self.request_with(name, payload, |outcome| outcome).await
    }

    /// Like [`Connection::request`], but runs `on_ack` on the reader task
    /// before any later frame is dispatched.
    pub(crate) async fn request_with<T, F>(
        &self,
        name: &str,
        payload: Value,
        on_ack: F,
    ) -> ProbeResult<T>
    where
        T: Send + 'static,
        F: FnOnce(ProbeResult<Value>) -> ProbeResult<T> + Send + 'static,
    {
        if self.state() != ConnectionState::Connected {
            return Err(ProbeError::Connection(format!(
                "connection {} is {}",
                self.id(),
                self.state()
            )));
        }

        let id = self.inner.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = tokio::sync::oneshot::channel();
        lock(&self.inner.pending).insert(
            id,
            Box::new(move |outcome| {
                let _ = tx.send(on_ack(outcome));
            }),
        );

        // disconnect() drains pending after flipping state; re-check so an
        // entry inserted after the drain cannot hang.
        if self.is_disconnected() {
            lock(&self.inner.pending).remove(&id);
            return Err(ProbeError::Connection("connection closed".to_string()));
        }

        if let Err(e) = self.send_frame(Frame::request(name, payload, id)).await {
            lock(&self.inner.pending).remove(&id);
            return Err(e.into());
        }

        rx.await
            .map_err(|_| ProbeError::Connection("connection closed".to_string()))?
    }

    /// Round-trips `connection:ping`. Resolves to `"pong"`.
    pub async fn ping(&self) -> ProbeResult<Value> {
        self.request(CONNECTION_PING, Value::Null).await
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Ends the session. Idempotent: only the first call has any effect.
    ///
    /// Unbinds every event handler, fails every pending request, drops the
    /// remote probe cache and closes the transport.
    pub fn disconnect(&self, reason: DisconnectReason) {
        let previous = self.inner.state.send_replace(ConnectionState::Disconnected);
        if previous == ConnectionState::Disconnected {
            return;
        }

        *lock(&self.inner.disconnect_reason) = Some(reason.clone());
        self.inner.cancel.cancel();
        let unbound = self.inner.events.remove_all_events();

        let pending: Vec<AckCallback> = lock(&self.inner.pending)
            .drain()
            .map(|(_, callback)| callback)
            .collect();
        let failed = pending.len();
        for callback in pending {
            callback(Err(ProbeError::Connection(format!(
                "connection closed ({reason})"
            ))));
        }

        self.inner.remote_probes.clear();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Some(mut writer) = inner.writer.lock().await.take() {
                let _ = writer.shutdown().await;
            }
        });

        info!(
            connection = self.id(),
            endpoint = ?self.inner.endpoint.as_ref().map(ToString::to_string),
            %reason,
            unbound,
            failed,
            "Connection disconnected"
        );
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The dial target, for outbound connections.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.inner.endpoint.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Waits until the connection is connected or disconnected, or `limit`
    /// elapses. Returns the state at that point.
    pub async fn wait_settled(&self, limit: Duration) -> ConnectionState {
        let mut rx = self.subscribe_state();
        let settled = match timeout(limit, rx.wait_for(|s| *s >= ConnectionState::Connected)).await {
            Ok(Ok(state)) => *state,
            _ => self.state(),
        };
        settled
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    /// The peer's handshake info, once received.
    pub fn remote_info(&self) -> Option<ConnectionInfo> {
        self.inner
            .remote
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The info this side sent at handshake.
    pub fn local_info(&self) -> &ConnectionInfo {
        &self.inner.local
    }

    /// True if this connection may relay requests for other hosts.
    pub fn is_gateway(&self) -> bool {
        self.inner.gateway.load(Ordering::Relaxed)
    }

    pub fn set_gateway(&self, gateway: bool) {
        self.inner.gateway.store(gateway, Ordering::Relaxed);
    }

    /// True if inbound probe requests are refused.
    pub fn firewall(&self) -> bool {
        self.inner.firewall.load(Ordering::Relaxed)
    }

    pub fn set_firewall(&self, firewall: bool) {
        self.inner.firewall.store(firewall, Ordering::Relaxed);
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        *lock(&self.inner.connected_at)
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        lock(&self.inner.disconnect_reason).clone()
    }

    /// Binds a handler for an event name.
    pub fn add_event(&self, name: impl Into<String>, handler: EventHandler) -> Result<(), EventError> {
        self.inner.events.add_event(name, handler)
    }

    pub fn remove_event(&self, name: &str) -> bool {
        self.inner.events.remove_event(name)
    }

    pub fn remove_all_events(&self) -> usize {
        self.inner.events.remove_all_events()
    }

    /// Number of probes this connection serves to its peer.
    pub fn incoming_count(&self) -> usize {
        lock(&self.inner.incoming).len()
    }

    /// Number of remote probe proxies obtained over this connection.
    pub fn remote_probe_count(&self) -> usize {
        self.inner.remote_probes.len()
    }

    /// Local references held on a remote probe proxy.
    pub fn remote_probe_refs(&self, probe_id: &ProbeId) -> Option<usize> {
        self.inner.remote_probes.ref_count(probe_id)
    }

    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            id: self.id(),
            state: self.state(),
            endpoint: self.endpoint().map(ToString::to_string),
            remote: self.remote_info(),
            gateway: self.is_gateway(),
            firewall: self.firewall(),
            connected_at: self.connected_at(),
            disconnect_reason: self.disconnect_reason().map(|r| r.to_string()),
            incoming_probes: self.incoming_count(),
            remote_probes: self.remote_probe_count(),
        }
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// A token cancelled when this connection disconnects.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    pub(crate) fn remote_probes(&self) -> &RemoteProbeCache {
        &self.inner.remote_probes
    }

    pub(crate) fn incoming(&self) -> MutexGuard<'_, HashMap<ProbeId, IncomingMonitor>> {
        lock(&self.inner.incoming)
    }

    /// Removes and returns every incoming monitor.
    pub(crate) fn take_incoming(&self) -> Vec<IncomingMonitor> {
        self.incoming().drain().map(|(_, monitor)| monitor).collect()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
