//! Error types for the proxy.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to open a TCP connection to the upstream server.
    #[error("Failed to dial upstream '{addr}': {source}")]
    Dial {
        /// The address we tried to reach.
        addr: String,
        /// The underlying socket error.
        #[source]
        source: io::Error,
    },

    /// The single upstream TLS handshake failed (cached outcome).
    #[error("Upstream TLS handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// TLS configuration or client-facing handshake error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// The client sent a request the proxy cannot route.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// An operation needed the server side of the session but none exists.
    #[error("No server connection for this session")]
    NoServerConn,

    /// Proxy server error.
    #[error("Proxy error: {0}")]
    Proxy(String),
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

/// CA error type.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to generate CA certificate.
    #[error("Failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read CA certificate.
    #[error("Failed to read CA: {0}")]
    Read(#[from] io::Error),

    /// Failed to parse CA certificate.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA certificate.
    #[error("Failed to write CA: {0}")]
    Write(String),

    /// Failed to sign a leaf certificate.
    #[error("Failed to issue certificate for '{host}': {reason}")]
    Signing {
        /// The server name the leaf was requested for.
        host: String,
        /// Why signing failed.
        reason: String,
    },
}

/// Outcome of a failed upstream handshake.
///
/// Cloned out to every waiter on the handshake rendezvous, so it carries the
/// error kind and rendered message rather than the original error value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandshakeError {
    kind: io::ErrorKind,
    message: String,
}

impl HandshakeError {
    /// Creates a handshake error with the given kind and message.
    pub fn new(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Returns the IO error kind of the original failure.
    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }
}

impl From<&io::Error> for HandshakeError {
    fn from(err: &io::Error) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<&ProxyError> for HandshakeError {
    fn from(err: &ProxyError) -> Self {
        match err {
            ProxyError::Handshake(cached) => cached.clone(),
            ProxyError::Io(source) | ProxyError::Dial { source, .. } => {
                Self::new(source.kind(), err.to_string())
            }
            other => Self::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Cached result of a wrapper's first close.
///
/// Two values compare equal only when they share the same cached error, which
/// is what every repeated `close` call hands back.
#[derive(Debug, Clone, Error)]
#[error("close failed: {0}")]
pub struct CloseError(#[source] Arc<io::Error>);

impl CloseError {
    pub(crate) fn new(err: io::Error) -> Self {
        Self(Arc::new(err))
    }

    /// Returns the IO error kind of the original close failure.
    pub fn kind(&self) -> io::ErrorKind {
        self.0.kind()
    }
}

impl PartialEq for CloseError {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
