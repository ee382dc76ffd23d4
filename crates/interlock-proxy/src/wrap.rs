//! Close-once connection wrappers.
//!
//! Both sides of a session are wrapped so that closing either one closes the
//! other and fires the matching addon event exactly once. The first `close`
//! performs the real close and caches its result; every later call returns the
//! cached value without touching the transport again.
//!
//! Each wrapper keeps a [`Weak`] reference to its session, so a wrapper never
//! keeps a session alive and a session that is already gone is simply skipped
//! when cascading.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::context::ConnContext;
use crate::error::CloseError;

/// The closable part of a raw connection.
pub trait Transport: Send + Sync + 'static {
    /// Closes the underlying connection in both directions.
    fn close(&self) -> io::Result<()>;
}

impl Transport for std::net::TcpStream {
    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Splits off a std handle sharing the socket of `stream`.
///
/// The tokio stream keeps doing the I/O; the handle is what a wrapper closes.
pub(crate) fn split_close_handle(
    stream: TcpStream,
) -> io::Result<(TcpStream, std::net::TcpStream)> {
    let std_stream = stream.into_std()?;
    let handle = std_stream.try_clone()?;
    Ok((TcpStream::from_std(std_stream)?, handle))
}

#[derive(Default)]
struct CloseState {
    closed: bool,
    error: Option<CloseError>,
}

impl CloseState {
    fn result(&self) -> Result<(), CloseError> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Runs the real close at most once.
#[derive(Default)]
struct CloseOnce {
    state: Mutex<CloseState>,
}

impl CloseOnce {
    /// Returns whether this call performed the close, and the cached result.
    fn close(&self, raw: &dyn Transport) -> (bool, Result<(), CloseError>) {
        let mut state = self.state.lock();
        if state.closed {
            return (false, state.result());
        }
        state.closed = true;
        state.error = raw.close().err().map(CloseError::new);
        (true, state.result())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Client-side connection wrapper.
pub struct WrapClientConn {
    raw: Box<dyn Transport>,
    peer_addr: SocketAddr,
    close: CloseOnce,
    ctx: OnceCell<Weak<ConnContext>>,
}

impl fmt::Debug for WrapClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapClientConn")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WrapClientConn {
    /// Wraps a raw client transport.
    pub fn new(raw: Box<dyn Transport>, peer_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            raw,
            peer_addr,
            close: CloseOnce::default(),
            ctx: OnceCell::new(),
        })
    }

    /// Wraps an accepted TCP stream, returning the stream to do I/O on.
    pub fn from_tcp(stream: TcpStream) -> io::Result<(TcpStream, Arc<Self>)> {
        let peer_addr = stream.peer_addr()?;
        let (stream, handle) = split_close_handle(stream)?;
        Ok((stream, Self::new(Box::new(handle), peer_addr)))
    }

    /// Binds the wrapper to its session. Only the first binding sticks.
    pub(crate) fn bind(&self, ctx: Weak<ConnContext>) {
        let _ = self.ctx.set(ctx);
    }

    /// Remote address of the client.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Returns true once `close` has run.
    pub fn is_closed(&self) -> bool {
        self.close.is_closed()
    }

    /// Closes the client connection.
    ///
    /// The first call closes the transport, notifies `client_disconnected`
    /// and then closes every server connection of the session.
    pub fn close(&self) -> Result<(), CloseError> {
        let (first, result) = self.close.close(self.raw.as_ref());
        if !first {
            return result;
        }
        tracing::debug!(peer = %self.peer_addr, "Client connection closed");

        let Some(ctx) = self.ctx.get().and_then(Weak::upgrade) else {
            return result;
        };
        ctx.addons().client_disconnected(ctx.client_conn());
        if let Some(server) = ctx.server_conn() {
            server.close_all();
        }
        result
    }
}

/// Server-side connection wrapper.
pub struct WrapServerConn {
    raw: Box<dyn Transport>,
    address: String,
    close: CloseOnce,
    ctx: Weak<ConnContext>,
}

impl fmt::Debug for WrapServerConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapServerConn")
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WrapServerConn {
    /// Wraps a raw upstream transport belonging to `ctx`.
    pub fn new(
        raw: Box<dyn Transport>,
        address: impl Into<String>,
        ctx: Weak<ConnContext>,
    ) -> Arc<Self> {
        Arc::new(Self {
            raw,
            address: address.into(),
            close: CloseOnce::default(),
            ctx,
        })
    }

    /// `host:port` this connection was dialed to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns true once `close` has run.
    pub fn is_closed(&self) -> bool {
        self.close.is_closed()
    }

    /// Closes the upstream connection.
    ///
    /// The first call closes the transport and notifies `server_disconnected`.
    /// If this is still the session's attached server connection, the client
    /// side is closed too; a connection already replaced by a re-dial is not
    /// paired with the client any more.
    pub fn close(&self) -> Result<(), CloseError> {
        let (first, result) = self.close.close(self.raw.as_ref());
        if !first {
            return result;
        }
        tracing::debug!(address = %self.address, "Server connection closed");

        let Some(ctx) = self.ctx.upgrade() else {
            return result;
        };
        ctx.addons().server_disconnected(&ctx);
        if ctx.server_conn().map_or(false, |server| server.is_current(self)) {
            ctx.close_client();
        }
        result
    }
}

/// Listener that hands out wrapped client connections.
#[derive(Debug)]
pub struct WrapListener {
    inner: TcpListener,
}

impl WrapListener {
    /// Wraps an already bound listener.
    pub fn new(inner: TcpListener) -> Self {
        Self { inner }
    }

    /// Binds a new listener to `addr`.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts the next client, returning the stream and its wrapper.
    pub async fn accept(&self) -> io::Result<(TcpStream, Arc<WrapClientConn>)> {
        let (stream, peer_addr) = self.inner.accept().await?;
        let (stream, handle) = split_close_handle(stream)?;
        Ok((stream, WrapClientConn::new(Box::new(handle), peer_addr)))
    }
}
