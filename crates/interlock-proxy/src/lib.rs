//! Interlock Proxy - connection pairing and TLS interception core.
//!
//! This crate provides an HTTP/HTTPS proxy that pairs every client connection
//! with its upstream connection and, for `CONNECT` tunnels carrying TLS,
//! intercepts the session on the fly.
//!
//! ## Features
//!
//! - Generates root CA certificate on first run
//! - Mirrors the client's offered versions and cipher suites upstream
//! - Performs exactly one upstream handshake per session and shares its outcome
//! - Presents a leaf certificate signed for the requested server name
//! - Relays non-TLS tunnels as raw bytes
//! - Closing either side of a session closes the other, exactly once
//! - Notifies registered addons of connection lifecycle events
//!
//! ## Architecture
//!
//! ```text
//! Client ─► WrapListener ─► ConnContext ─► plain request? ──► DispatchClient (plain) ─► Upstream
//!                                │
//!                                └─► CONNECT ─► first byte 0x16?
//!                                                 │
//!                         ┌───────────────────────┴────────────────────┐
//!                         │ No                                          │ Yes
//!                         ▼                                             ▼
//!                    Raw relay                 read ClientHello ─► upstream handshake (once)
//!                                                                       │
//!                                                         fire rendezvous, issue leaf
//!                                                                       │
//!                                                                       ▼
//!                                              client handshake ─► DispatchClient (TLS)
//! ```

mod addon;
mod ca;
mod connection;
mod context;
mod dispatch;
mod error;
mod greeting;
mod handler;
mod provision;
mod proxy;
mod rendezvous;
mod rewind;
mod upstream_tls;
mod wrap;

#[cfg(test)]
mod test_support;

pub use addon::{Addon, Addons, LogAddon};
pub use ca::{default_ca_dir, CaManager, CertificateAuthority, LocalAuthority};
pub use connection::{ClientConn, ServerConn, UpstreamTlsStream};
pub use context::{ConnContext, ProxyState};
pub use dispatch::{DispatchClient, ProxyBody};
pub use error::{CaError, CloseError, HandshakeError, ProxyError, Result};
pub use greeting::{looks_like_tls, read_client_greeting, ClientGreeting};
pub use handler::serve_client;
pub use provision::CertificateProvisioner;
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use rendezvous::{HandshakeOutcome, HandshakeRendezvous, TlsState};
pub use rewind::Rewind;
pub use upstream_tls::{
    env_key_log, version_range, FileKeyLog, UpstreamTlsParams, HTTP11_ALPN,
};
pub use wrap::{Transport, WrapClientConn, WrapListener, WrapServerConn};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8766;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_correct() {
        assert_eq!(DEFAULT_PROXY_PORT, 8766);
    }
}
