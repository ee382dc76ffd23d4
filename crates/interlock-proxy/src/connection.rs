//! Client-side and server-side connection identity.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::dispatch::DispatchClient;
use crate::rendezvous::{HandshakeOutcome, HandshakeRendezvous};
use crate::wrap::{WrapClientConn, WrapServerConn};

/// Upstream TLS stream negotiated by the certificate flow.
pub type UpstreamTlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// The client half of a session.
pub struct ClientConn {
    id: Uuid,
    conn: Arc<WrapClientConn>,
    tls: AtomicBool,
}

impl fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConn")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr())
            .field("tls", &self.is_tls())
            .finish()
    }
}

impl ClientConn {
    pub(crate) fn new(conn: Arc<WrapClientConn>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conn,
            tls: AtomicBool::new(false),
        }
    }

    /// Unique id of this connection.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The wrapped client connection.
    pub fn conn(&self) -> &Arc<WrapClientConn> {
        &self.conn
    }

    /// Remote address of the client.
    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    /// Returns true once the client has been confirmed to speak TLS.
    pub fn is_tls(&self) -> bool {
        self.tls.load(Ordering::SeqCst)
    }

    /// Marks the client as speaking TLS. Returns false if it already was.
    pub(crate) fn mark_tls(&self) -> bool {
        self.tls
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// The server half of a session.
pub struct ServerConn {
    id: Uuid,
    address: RwLock<Option<String>>,
    conn: RwLock<Option<Arc<WrapServerConn>>>,
    /// Connections replaced by a re-dial that have not been closed yet.
    retired: Mutex<Vec<Arc<WrapServerConn>>>,
    handshake: HandshakeRendezvous,
    /// Plain upstream stream, until the certificate flow or a tunnel takes it.
    upstream: Mutex<Option<TcpStream>>,
    /// Negotiated upstream TLS stream, until the TLS dispatch dial takes it.
    tls_stream: Mutex<Option<UpstreamTlsStream>>,
    client: OnceCell<DispatchClient>,
}

impl fmt::Debug for ServerConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConn")
            .field("id", &self.id)
            .field("address", &self.address())
            .field("handshake", &self.handshake)
            .field("has_dispatch", &self.client.get().is_some())
            .finish()
    }
}

impl ServerConn {
    pub(crate) fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            address: RwLock::new(None),
            conn: RwLock::new(None),
            retired: Mutex::new(Vec::new()),
            handshake: HandshakeRendezvous::new(),
            upstream: Mutex::new(None),
            tls_stream: Mutex::new(None),
            client: OnceCell::new(),
        }
    }

    /// Unique id of this connection.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// `host:port` of the real upstream, once known.
    pub fn address(&self) -> Option<String> {
        self.address.read().clone()
    }

    /// The wrapped upstream connection, once dialed.
    pub fn conn(&self) -> Option<Arc<WrapServerConn>> {
        self.conn.read().clone()
    }

    /// The rendezvous fired by the upstream TLS handshake.
    pub fn handshake(&self) -> &HandshakeRendezvous {
        &self.handshake
    }

    /// Waits for the upstream TLS handshake and returns its cached outcome.
    pub async fn tls_state(&self) -> HandshakeOutcome {
        self.handshake.wait().await
    }

    /// The dispatch client bound to this connection, once built.
    pub fn dispatch(&self) -> Option<&DispatchClient> {
        self.client.get()
    }

    pub(crate) fn set_dispatch(&self, client: DispatchClient) -> bool {
        self.client.set(client).is_ok()
    }

    pub(crate) fn set_address(&self, address: impl Into<String>) {
        *self.address.write() = Some(address.into());
    }

    pub(crate) fn attach(&self, conn: Arc<WrapServerConn>) {
        self.set_address(conn.address());
        let Some(previous) = self.conn.write().replace(conn) else {
            return;
        };
        let mut retired = self.retired.lock();
        retired.retain(|conn| !conn.is_closed());
        if !previous.is_closed() {
            retired.push(previous);
        }
    }

    /// Returns true if `conn` is the connection currently attached.
    pub(crate) fn is_current(&self, conn: &WrapServerConn) -> bool {
        self.conn
            .read()
            .as_ref()
            .map_or(false, |current| std::ptr::eq(Arc::as_ptr(current), conn))
    }

    /// Closes the attached connection and every connection it replaced.
    pub(crate) fn close_all(&self) {
        let retired = std::mem::take(&mut *self.retired.lock());
        for conn in retired {
            let _ = conn.close();
        }
        if let Some(conn) = self.conn() {
            let _ = conn.close();
        }
    }

    pub(crate) fn store_upstream(&self, stream: TcpStream) {
        *self.upstream.lock() = Some(stream);
    }

    pub(crate) fn take_upstream(&self) -> Option<TcpStream> {
        self.upstream.lock().take()
    }

    pub(crate) fn store_tls_stream(&self, stream: UpstreamTlsStream) {
        *self.tls_stream.lock() = Some(stream);
    }

    pub(crate) fn take_tls_stream(&self) -> Option<UpstreamTlsStream> {
        self.tls_stream.lock().take()
    }
}
