//! Certificate flow: one upstream handshake, then one leaf certificate.

use std::fmt;
use std::sync::Arc;

use rustls::sign::CertifiedKey;
use rustls::KeyLog;
use tokio_rustls::TlsConnector;

use crate::ca::CertificateAuthority;
use crate::connection::ServerConn;
use crate::error::{HandshakeError, ProxyError, Result};
use crate::greeting::ClientGreeting;
use crate::rendezvous::TlsState;
use crate::upstream_tls::UpstreamTlsParams;

/// Obtains certificates for intercepted sessions.
pub struct CertificateProvisioner {
    authority: Arc<dyn CertificateAuthority>,
    insecure_skip_verify: bool,
    key_log: Option<Arc<dyn KeyLog>>,
}

impl fmt::Debug for CertificateProvisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateProvisioner")
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("key_log", &self.key_log.is_some())
            .finish()
    }
}

impl CertificateProvisioner {
    /// Creates a provisioner signing with `authority`.
    pub fn new(authority: Arc<dyn CertificateAuthority>, insecure_skip_verify: bool) -> Self {
        Self {
            authority,
            insecure_skip_verify,
            key_log: None,
        }
    }

    /// Logs upstream session secrets to `key_log`.
    pub fn with_key_log(mut self, key_log: Arc<dyn KeyLog>) -> Self {
        self.key_log = Some(key_log);
        self
    }

    /// Whether upstream certificates are accepted unverified.
    pub fn insecure_skip_verify(&self) -> bool {
        self.insecure_skip_verify
    }

    /// Handshakes with the upstream of `server`, then issues the client-facing
    /// certificate.
    ///
    /// The handshake outcome is published on the server's rendezvous exactly
    /// once, whether it succeeds or fails. The authority is only consulted
    /// after a successful handshake.
    pub async fn provision(
        &self,
        server: &ServerConn,
        greeting: &ClientGreeting,
    ) -> Result<Arc<CertifiedKey>> {
        let server_name = match self.handshake(server, greeting).await {
            Ok(state) => {
                let name = state.server_name.clone();
                server.handshake().fire(Ok(Arc::new(state)));
                name
            }
            Err(err) => {
                tracing::warn!(
                    address = ?server.address(),
                    "Upstream TLS handshake failed: {}",
                    err
                );
                let cached = HandshakeError::from(&err);
                server.handshake().fire(Err(cached.clone()));
                return Err(ProxyError::Handshake(cached));
            }
        };

        Ok(self.authority.issue(&server_name)?)
    }

    async fn handshake(&self, server: &ServerConn, greeting: &ClientGreeting) -> Result<TlsState> {
        let address = server.address().unwrap_or_default();
        let params = UpstreamTlsParams::from_greeting(
            greeting,
            host_of(&address),
            self.insecure_skip_verify,
        )?;
        let config = params.client_config(self.key_log.clone())?;
        let name = params.rustls_server_name()?;

        let stream = server.take_upstream().ok_or(ProxyError::NoServerConn)?;
        let tls = TlsConnector::from(Arc::new(config))
            .connect(name, stream)
            .await?;

        let (_, conn) = tls.get_ref();
        let state = TlsState::from_connection(conn, &params.server_name);
        tracing::debug!(
            server_name = %params.server_name,
            version = ?state.protocol_version,
            suite = ?state.cipher_suite,
            "Upstream TLS established"
        );
        server.store_tls_stream(tls);
        Ok(state)
    }
}

/// Host part of `host:port`, without IPv6 brackets.
fn host_of(address: &str) -> &str {
    let host = match address.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => address,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}
