//! Upstream TLS configuration mirrored from the client's greeting.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::aws_lc_rs::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CipherSuite, ClientConfig, DigitallySignedStruct, KeyLog, KeyLogFile, ProtocolVersion,
    RootCertStore, SignatureScheme, SupportedCipherSuite,
};

use crate::error::{ProxyError, Result};
use crate::greeting::ClientGreeting;

/// The only application protocol negotiated upstream.
pub const HTTP11_ALPN: &[u8] = b"http/1.1";

/// Returns `(min, max)` over `versions`, which need not be ordered.
pub fn version_range(versions: &[ProtocolVersion]) -> Option<(ProtocolVersion, ProtocolVersion)> {
    let min = versions.iter().copied().min_by_key(|v| u16::from(*v))?;
    let max = versions.iter().copied().max_by_key(|v| u16::from(*v))?;
    Some((min, max))
}

/// Parameters of the single upstream handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTlsParams {
    /// Name sent as SNI and verified against the upstream certificate.
    pub server_name: String,
    /// Lowest version offered by the client.
    pub min_version: ProtocolVersion,
    /// Highest version offered by the client.
    pub max_version: ProtocolVersion,
    /// The client's offered suites, in its order.
    pub cipher_suites: Vec<CipherSuite>,
    /// Always `http/1.1`.
    pub alpn_protocols: Vec<Vec<u8>>,
    /// Skip upstream certificate verification.
    pub insecure_skip_verify: bool,
}

impl UpstreamTlsParams {
    /// Derives upstream parameters from the client's greeting.
    ///
    /// `fallback_host` is used when the client sent no server name.
    pub fn from_greeting(
        greeting: &ClientGreeting,
        fallback_host: &str,
        insecure_skip_verify: bool,
    ) -> Result<Self> {
        let server_name = greeting
            .server_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| fallback_host.to_string());
        let (min_version, max_version) = version_range(&greeting.supported_versions)
            .ok_or_else(|| ProxyError::Tls("client offered no protocol versions".into()))?;

        Ok(Self {
            server_name,
            min_version,
            max_version,
            cipher_suites: greeting.cipher_suites.clone(),
            alpn_protocols: vec![HTTP11_ALPN.to_vec()],
            insecure_skip_verify,
        })
    }

    /// Builds the rustls client configuration for these parameters.
    pub fn client_config(&self, key_log: Option<Arc<dyn KeyLog>>) -> Result<ClientConfig> {
        let base = default_provider();
        let mut suites: Vec<SupportedCipherSuite> = self
            .cipher_suites
            .iter()
            .filter_map(|offered| {
                base.cipher_suites
                    .iter()
                    .find(|supported| supported.suite() == *offered)
                    .copied()
            })
            .collect();
        if suites.is_empty() {
            tracing::debug!(
                server_name = %self.server_name,
                "No offered cipher suite is supported, using provider defaults"
            );
            suites = base.cipher_suites.clone();
        }

        let (min, max) = (u16::from(self.min_version), u16::from(self.max_version));
        let versions: Vec<_> = rustls::ALL_VERSIONS
            .iter()
            .copied()
            .filter(|v| (min..=max).contains(&u16::from(v.version)))
            .collect();
        if versions.is_empty() {
            return Err(ProxyError::Tls(format!(
                "no supported protocol version between {:?} and {:?}",
                self.min_version, self.max_version
            )));
        }

        let schemes = base
            .signature_verification_algorithms
            .supported_schemes();
        let provider = Arc::new(CryptoProvider {
            cipher_suites: suites,
            ..base
        });
        let builder = ClientConfig::builder_with_provider(provider).with_protocol_versions(&versions)?;

        let mut config = if self.insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureSkipVerify { schemes }))
                .with_no_client_auth()
        } else {
            let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        };

        config.alpn_protocols = self.alpn_protocols.clone();
        if let Some(key_log) = key_log {
            config.key_log = key_log;
        }
        Ok(config)
    }

    /// The server name as rustls expects it.
    pub fn rustls_server_name(&self) -> Result<ServerName<'static>> {
        ServerName::try_from(self.server_name.clone()).map_err(|e| {
            ProxyError::Tls(format!("invalid server name '{}': {}", self.server_name, e))
        })
    }
}

/// Accepts any upstream certificate.
#[derive(Debug)]
struct InsecureSkipVerify {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for InsecureSkipVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

/// Appends session secrets to a file in NSS key log format.
#[derive(Debug)]
pub struct FileKeyLog {
    file: Mutex<File>,
}

impl FileKeyLog {
    /// Opens `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl KeyLog for FileKeyLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let line = format!("{} {} {}\n", label, hex(client_random), hex(secret));
        if let Err(e) = self.file.lock().write_all(line.as_bytes()) {
            tracing::warn!("Failed to write key log: {}", e);
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// Key log writing to `SSLKEYLOGFILE`, if that variable is set.
pub fn env_key_log() -> Option<Arc<dyn KeyLog>> {
    std::env::var_os("SSLKEYLOGFILE")?;
    Some(Arc::new(KeyLogFile::new()))
}
