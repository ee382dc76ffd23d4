//! One-shot handshake rendezvous.
//!
//! Each server connection owns a [`HandshakeRendezvous`]. The certificate flow
//! fires it exactly once with the outcome of the single upstream TLS handshake;
//! the TLS dispatch dial and [`ServerConn::tls_state`](crate::ServerConn::tls_state)
//! wait on it and all observe the same cached outcome.

use std::fmt;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::{CipherSuite, ClientConnection, ProtocolVersion};
use tokio::sync::watch;

use crate::error::HandshakeError;

/// Cached outcome of an upstream handshake.
pub type HandshakeOutcome = std::result::Result<Arc<TlsState>, HandshakeError>;

/// Snapshot of a negotiated upstream TLS session.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsState {
    /// Negotiated protocol version.
    pub protocol_version: Option<ProtocolVersion>,
    /// Negotiated cipher suite.
    pub cipher_suite: Option<CipherSuite>,
    /// Negotiated ALPN protocol.
    pub alpn_protocol: Option<Vec<u8>>,
    /// Server name sent upstream.
    pub server_name: String,
    /// Certificate chain presented by the upstream server.
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

impl TlsState {
    /// Captures the state of an established client-side session.
    pub fn from_connection(conn: &ClientConnection, server_name: &str) -> Self {
        Self {
            protocol_version: conn.protocol_version(),
            cipher_suite: conn.negotiated_cipher_suite().map(|suite| suite.suite()),
            alpn_protocol: conn.alpn_protocol().map(<[u8]>::to_vec),
            server_name: server_name.to_string(),
            peer_certificates: conn
                .peer_certificates()
                .map(<[CertificateDer<'static>]>::to_vec)
                .unwrap_or_default(),
        }
    }
}

/// Single-fire broadcast of a handshake outcome.
pub struct HandshakeRendezvous {
    slot: watch::Sender<Option<HandshakeOutcome>>,
}

impl fmt::Debug for HandshakeRendezvous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeRendezvous")
            .field("fired", &self.is_fired())
            .finish()
    }
}

impl Default for HandshakeRendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeRendezvous {
    /// Creates a pending rendezvous.
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Fires the rendezvous with `outcome`.
    ///
    /// Returns `false` (and leaves the cached outcome untouched) if it had
    /// already fired.
    pub fn fire(&self, outcome: HandshakeOutcome) -> bool {
        let mut outcome = Some(outcome);
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    /// Returns whether the rendezvous has fired.
    pub fn is_fired(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Returns the cached outcome without waiting.
    pub fn try_outcome(&self) -> Option<HandshakeOutcome> {
        self.slot.borrow().clone()
    }

    /// Waits until the rendezvous fires and returns the cached outcome.
    pub async fn wait(&self) -> HandshakeOutcome {
        let mut rx = self.slot.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(|| {
            Err(HandshakeError::new(
                std::io::ErrorKind::BrokenPipe,
                "handshake rendezvous closed before firing",
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use super::*;

    fn state(name: &str) -> Arc<TlsState> {
        Arc::new(TlsState {
            protocol_version: Some(ProtocolVersion::TLSv1_3),
            cipher_suite: Some(CipherSuite::TLS13_AES_128_GCM_SHA256),
            alpn_protocol: Some(b"http/1.1".to_vec()),
            server_name: name.to_string(),
            peer_certificates: Vec::new(),
        })
    }

    #[test]
    fn starts_pending() {
        let rendezvous = HandshakeRendezvous::new();
        assert!(!rendezvous.is_fired());
        assert!(rendezvous.try_outcome().is_none());
    }

    #[test]
    fn fires_only_once() {
        let rendezvous = HandshakeRendezvous::new();
        assert!(rendezvous.fire(Ok(state("a.example"))));
        assert!(!rendezvous.fire(Err(HandshakeError::new(io::ErrorKind::Other, "late"))));

        let outcome = rendezvous.try_outcome().unwrap().unwrap();
        assert_eq!(outcome.server_name, "a.example");
    }

    #[tokio::test]
    async fn wait_after_fire_returns_immediately() {
        let rendezvous = HandshakeRendezvous::new();
        rendezvous.fire(Err(HandshakeError::new(
            io::ErrorKind::ConnectionRefused,
            "refused",
        )));

        let first = rendezvous.wait().await.unwrap_err();
        let second = rendezvous.wait().await.unwrap_err();
        assert_eq!(first, second);
        assert_eq!(first.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn concurrent_waiters_share_outcome() {
        let rendezvous = Arc::new(HandshakeRendezvous::new());

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let rendezvous = rendezvous.clone();
                tokio::spawn(async move { rendezvous.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        for waiter in &waiters {
            assert!(!waiter.is_finished());
        }

        let fired = state("a.example");
        assert!(rendezvous.fire(Ok(fired.clone())));

        for waiter in waiters {
            let outcome = waiter.await.unwrap().unwrap();
            assert!(Arc::ptr_eq(&outcome, &fired));
        }
    }
}
