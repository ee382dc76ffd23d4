//! Intercepting proxy server.
//!
//! Accepts clients on a [`WrapListener`] and runs one session task per client.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::KeyLog;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::addon::{Addon, Addons};
use crate::ca::{CaManager, CertificateAuthority};
use crate::context::ProxyState;
use crate::error::{ProxyError, Result};
use crate::handler::serve_client;
use crate::provision::CertificateProvisioner;
use crate::wrap::WrapListener;
use crate::DEFAULT_PROXY_PORT;

/// Proxy server configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// The CA manager for certificate generation.
    pub ca_manager: CaManager,
    /// Accept upstream certificates without verification.
    pub ssl_insecure: bool,
    /// Lifecycle observers, in invocation order.
    pub addons: Addons,
    /// Sink for upstream TLS session secrets.
    pub key_log: Option<Arc<dyn KeyLog>>,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("addr", &self.addr)
            .field("ca_manager", &self.ca_manager)
            .field("ssl_insecure", &self.ssl_insecure)
            .field("addons", &self.addons)
            .field("key_log", &self.key_log.is_some())
            .finish()
    }
}

impl ProxyConfig {
    /// Creates a new configuration with default settings.
    pub fn new() -> Result<Self> {
        let ca_manager = CaManager::with_default_dir().map_err(ProxyError::Ca)?;
        Ok(Self::with_ca_dir(ca_manager))
    }

    /// Creates a configuration using `ca_manager` and defaults for the rest.
    pub fn with_ca_dir(ca_manager: CaManager) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            ca_manager,
            ssl_insecure: false,
            addons: Addons::new(),
            key_log: None,
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the CA manager.
    pub fn with_ca_manager(mut self, ca_manager: CaManager) -> Self {
        self.ca_manager = ca_manager;
        self
    }

    /// Skips upstream certificate verification.
    pub fn with_ssl_insecure(mut self, ssl_insecure: bool) -> Self {
        self.ssl_insecure = ssl_insecure;
        self
    }

    /// Registers an addon after those already registered.
    pub fn with_addon(mut self, addon: Arc<dyn Addon>) -> Self {
        self.addons.push(addon);
        self
    }

    /// Sets the key log sink.
    pub fn with_key_log(mut self, key_log: Arc<dyn KeyLog>) -> Self {
        self.key_log = Some(key_log);
        self
    }
}

/// Intercepting proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    state: Arc<ProxyState>,
}

impl ProxyServer {
    /// Creates a new proxy server, generating the CA if it is missing.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let authority: Arc<dyn CertificateAuthority> =
            Arc::new(config.ca_manager.ensure_ca().map_err(ProxyError::Ca)?);
        let mut provisioner = CertificateProvisioner::new(authority, config.ssl_insecure);
        if let Some(key_log) = &config.key_log {
            provisioner = provisioner.with_key_log(key_log.clone());
        }
        let state = Arc::new(ProxyState::new(config.addons.clone(), provisioner));

        Ok(Self { config, state })
    }

    /// Creates a proxy server with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ProxyConfig::new()?)
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the CA certificate path for user installation.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.config.ca_manager.cert_path()
    }

    /// Returns the CA certificate as DER bytes.
    pub fn ca_cert_der(&self) -> Result<Vec<u8>> {
        self.config
            .ca_manager
            .read_cert_der()
            .map_err(ProxyError::Ca)
    }

    /// Runs the proxy until the listener fails.
    pub async fn run(self) -> Result<()> {
        let listener = WrapListener::bind(self.config.addr).await?;
        tracing::info!("Starting proxy on {}", listener.local_addr()?);
        tracing::info!("CA certificate: {:?}", self.ca_cert_path());

        accept_loop(listener, self.state).await
    }

    /// Starts the proxy server in the background.
    ///
    /// The listener is bound before returning, so the handle reports the real
    /// address even when port 0 was requested.
    pub fn start(self) -> Result<ProxyHandle> {
        let std_listener = std::net::TcpListener::bind(self.config.addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = WrapListener::new(TcpListener::from_std(std_listener)?);
        let addr = listener.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let state = self.state;

        tracing::info!("Starting proxy on {}", addr);
        let handle = tokio::spawn(async move {
            tokio::select! {
                result = accept_loop(listener, state) => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutdown signal received");
                }
            }
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

async fn accept_loop(listener: WrapListener, state: Arc<ProxyState>) -> Result<()> {
    loop {
        let (stream, conn) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) if is_transient(&e) => {
                tracing::warn!("Accept failed: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        tokio::spawn(serve_client(stream, conn, state.clone()));
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock
    )
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogAddon;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> ProxyConfig {
        ProxyConfig::with_ca_dir(CaManager::new(temp_dir.path().join("ca"))).with_port(0)
    }

    #[test]
    fn proxy_config_with_port() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir).with_port(8888);
        assert_eq!(config.addr.port(), 8888);
    }

    #[test]
    fn proxy_config_with_addr() {
        let temp_dir = TempDir::new().unwrap();
        let addr = SocketAddr::from(([0, 0, 0, 0], 9999));
        let config = test_config(&temp_dir).with_addr(addr);
        assert_eq!(config.addr, addr);
    }

    #[test]
    fn proxy_config_builders() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir)
            .with_ssl_insecure(true)
            .with_addon(Arc::new(LogAddon));
        assert!(config.ssl_insecure);
        assert_eq!(config.addons.len(), 1);
        assert!(format!("{:?}", config).contains("ssl_insecure: true"));
    }

    #[test]
    fn proxy_server_new_generates_ca() {
        let temp_dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&temp_dir)).unwrap();

        let cert_path = server.ca_cert_path();
        assert!(cert_path.to_string_lossy().contains("interlock-ca.crt"));
        assert!(cert_path.exists());
        assert!(!server.ca_cert_der().unwrap().is_empty());
    }

    #[tokio::test]
    async fn proxy_handle_reports_bound_port_and_stops() {
        let temp_dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&temp_dir)).unwrap();

        let handle = server.start().unwrap();
        assert_ne!(handle.addr().port(), 0);
        tokio::net::TcpStream::connect(handle.addr()).await.unwrap();

        handle.stop().await;
    }
}
