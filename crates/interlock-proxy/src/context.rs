//! Per-session connection context.
//!
//! A [`ConnContext`] pairs one client connection with at most one server
//! connection and drives the server side into existence: lazily for plain
//! HTTP, eagerly for tunnels, and through the certificate flow for
//! intercepted TLS.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustls::sign::CertifiedKey;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::addon::Addons;
use crate::connection::{ClientConn, ServerConn};
use crate::dispatch::DispatchClient;
use crate::error::{HandshakeError, ProxyError, Result};
use crate::greeting::ClientGreeting;
use crate::provision::CertificateProvisioner;
use crate::wrap::{split_close_handle, WrapClientConn, WrapServerConn};

/// Proxy-wide state shared by every session.
pub struct ProxyState {
    addons: Addons,
    provisioner: CertificateProvisioner,
}

impl fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyState")
            .field("addons", &self.addons)
            .field("provisioner", &self.provisioner)
            .finish()
    }
}

impl ProxyState {
    /// Creates the shared state.
    pub fn new(addons: Addons, provisioner: CertificateProvisioner) -> Self {
        Self {
            addons,
            provisioner,
        }
    }

    /// Registered addons.
    pub fn addons(&self) -> &Addons {
        &self.addons
    }

    /// The certificate provisioner.
    pub fn provisioner(&self) -> &CertificateProvisioner {
        &self.provisioner
    }
}

/// One client session and its upstream.
pub struct ConnContext {
    client: ClientConn,
    server: RwLock<Option<Arc<ServerConn>>>,
    tunnel: RwLock<Option<String>>,
    upgraded: AtomicBool,
    /// Number of HTTP server loops driving the client side.
    serving: AtomicUsize,
    drain: watch::Sender<bool>,
    state: Arc<ProxyState>,
}

/// Marks the client side as served by an HTTP loop until dropped.
pub(crate) struct Serving<'a>(&'a AtomicUsize);

impl Drop for Serving<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for ConnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnContext")
            .field("client", &self.client)
            .field("server", &self.server_conn())
            .field("tunnel", &self.tunnel_target())
            .finish()
    }
}

impl ConnContext {
    /// Creates the context for an accepted client and binds the wrapper to it.
    pub fn new(conn: Arc<WrapClientConn>, state: Arc<ProxyState>) -> Arc<Self> {
        let ctx = Arc::new(Self {
            client: ClientConn::new(conn.clone()),
            server: RwLock::new(None),
            tunnel: RwLock::new(None),
            upgraded: AtomicBool::new(false),
            serving: AtomicUsize::new(0),
            drain: watch::channel(false).0,
            state,
        });
        conn.bind(Arc::downgrade(&ctx));
        ctx
    }

    /// The client side of the session.
    pub fn client_conn(&self) -> &ClientConn {
        &self.client
    }

    /// The server side of the session, if created.
    pub fn server_conn(&self) -> Option<Arc<ServerConn>> {
        self.server.read().clone()
    }

    /// Registered addons.
    pub fn addons(&self) -> &Addons {
        &self.state.addons
    }

    /// `host:port` requested by the tunnel, if this is a tunnel session.
    pub fn tunnel_target(&self) -> Option<String> {
        self.tunnel.read().clone()
    }

    /// Records the tunnel target of this session.
    pub fn set_tunnel_target(&self, target: impl Into<String>) {
        *self.tunnel.write() = Some(target.into());
    }

    pub(crate) fn mark_upgraded(&self) {
        self.upgraded.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_upgraded(&self) -> bool {
        self.upgraded.load(Ordering::SeqCst)
    }

    pub(crate) fn serving(&self) -> Serving<'_> {
        self.serving.fetch_add(1, Ordering::SeqCst);
        Serving(&self.serving)
    }

    /// Resolves once the session has been asked to drain.
    pub(crate) async fn drained(&self) {
        let mut rx = self.drain.subscribe();
        let _ = rx.wait_for(|drain| *drain).await;
    }

    /// Closes the client side after its server side went away.
    ///
    /// A client served by an HTTP loop is drained instead. The loop finishes
    /// the response in flight, and its owner closes the client afterwards.
    pub(crate) fn close_client(&self) {
        if self.serving.load(Ordering::SeqCst) > 0 {
            self.drain.send_replace(true);
        } else {
            let _ = self.client.conn().close();
        }
    }

    /// Creates the server side for plain HTTP forwarding.
    ///
    /// No-op if a server side already exists or the client speaks TLS. The
    /// upstream is dialed lazily by the dispatch client, per request address.
    pub fn init_plain_server(self: &Arc<Self>) {
        let mut slot = self.server.write();
        if slot.is_some() || self.client.is_tls() {
            return;
        }
        let server = Arc::new(ServerConn::new());
        server.set_dispatch(DispatchClient::plain(Arc::downgrade(self)));
        *slot = Some(server);
    }

    /// Creates a fresh server side for a tunnel and dials its target.
    ///
    /// On failure the new server's handshake rendezvous is fired with the
    /// error, so nothing waiting on it hangs.
    pub async fn init_tunnel_server(self: &Arc<Self>) -> Result<Arc<ServerConn>> {
        let server = Arc::new(ServerConn::new());
        let replaced = self.server.write().replace(server.clone());
        if let Some(replaced) = replaced {
            replaced.close_all();
        }

        let Some(address) = self.tunnel_target() else {
            let err = ProxyError::InvalidRequest("session has no tunnel target".into());
            server.handshake().fire(Err(HandshakeError::from(&err)));
            return Err(err);
        };
        server.set_address(address.clone());

        match self.connect_server(&server, &address).await {
            Ok((stream, _)) => {
                server.store_upstream(stream);
                self.addons().server_connected(self);
                Ok(server)
            }
            Err(err) => {
                server.handshake().fire(Err(HandshakeError::from(&err)));
                Err(err)
            }
        }
    }

    /// Binds the TLS dispatch client to the tunnel's server side.
    ///
    /// No-op unless the client speaks TLS.
    pub fn init_tls_server(self: &Arc<Self>) -> Result<()> {
        if !self.client.is_tls() {
            return Ok(());
        }
        let server = self.server_conn().ok_or(ProxyError::NoServerConn)?;
        server.set_dispatch(DispatchClient::tls(Arc::downgrade(self)));
        Ok(())
    }

    /// Runs the certificate flow for the client's greeting.
    ///
    /// Performs the single upstream handshake and returns the certificate to
    /// present to the client.
    pub async fn issue_certificate(&self, greeting: &ClientGreeting) -> Result<Arc<CertifiedKey>> {
        let server = self.server_conn().ok_or(ProxyError::NoServerConn)?;
        self.state.provisioner.provision(&server, greeting).await
    }

    /// Dials `address` and attaches the wrapped connection to `server`.
    pub(crate) async fn connect_server(
        self: &Arc<Self>,
        server: &ServerConn,
        address: &str,
    ) -> Result<(TcpStream, Arc<WrapServerConn>)> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| ProxyError::Dial {
                addr: address.to_string(),
                source,
            })?;
        let (stream, handle) = split_close_handle(stream)?;
        let conn = WrapServerConn::new(Box::new(handle), address, Arc::downgrade(self));
        server.attach(conn.clone());
        tracing::debug!(client = %self.client.id(), address, "Server connection established");
        Ok((stream, conn))
    }
}
