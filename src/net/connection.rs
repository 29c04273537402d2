//! Per-connection metadata and connection tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Hold what a connection learned while passing its pipeline
//!   (client address, TLS facts, proxy header trust, negotiated protocol)
//! - Count live connections so shutdown can wait for them

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Application protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppProtocol {
    Http1,
    Http2,
}

impl AppProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppProtocol::Http1 => "HTTP/1.1",
            AppProtocol::Http2 => "HTTP/2",
        }
    }
}

impl fmt::Display for AppProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts about the TLS session, when there is one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSession {
    /// The peer presented a certificate that the verifier accepted.
    pub client_certificate: bool,
    /// Server name requested through SNI.
    pub server_name: Option<String>,
}

/// Metadata for one connection.
///
/// Filled in by the pipeline stages before the terminal stage starts, then
/// frozen behind an `Arc` and handed to every request on the connection.
/// Activity timestamps live in the connection's lifecycle manager.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    id: ConnectionId,
    listener: Arc<str>,
    peer_addr: SocketAddr,
    client_addr: SocketAddr,
    protocol: Option<AppProtocol>,
    proxy_headers_trusted: bool,
    tls: Option<TlsSession>,
    created_at: Instant,
}

impl ConnectionState {
    pub fn new(id: ConnectionId, listener: impl Into<Arc<str>>, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            listener: listener.into(),
            peer_addr,
            client_addr: peer_addr,
            protocol: None,
            proxy_headers_trusted: false,
            tls: None,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn listener(&self) -> &str {
        &self.listener
    }

    /// Address of the TCP peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Address of the real client: the PROXY protocol source when one was
    /// received, otherwise the TCP peer.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn set_client_addr(&mut self, addr: SocketAddr) {
        self.client_addr = addr;
    }

    /// Negotiated application protocol, once the terminal stage is chosen.
    pub fn protocol(&self) -> Option<AppProtocol> {
        self.protocol
    }

    pub fn set_protocol(&mut self, protocol: AppProtocol) {
        self.protocol = Some(protocol);
    }

    /// Whether proxy headers sent on this connection are honored.
    pub fn proxy_headers_trusted(&self) -> bool {
        self.proxy_headers_trusted
    }

    pub fn set_proxy_headers_trusted(&mut self, trusted: bool) {
        self.proxy_headers_trusted = trusted;
    }

    pub fn tls(&self) -> Option<&TlsSession> {
        self.tls.as_ref()
    }

    pub fn set_tls(&mut self, session: TlsSession) {
        self.tls = Some(session);
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Tracks active connections for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    /// Current count of active connections.
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until all connections are closed or the deadline passes.
    /// Returns the number of connections still open.
    pub async fn wait_for_shutdown(&self, deadline: Duration) -> u64 {
        let give_up = Instant::now() + deadline;
        while self.active_count() > 0 && Instant::now() < give_up {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.active_count()
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
