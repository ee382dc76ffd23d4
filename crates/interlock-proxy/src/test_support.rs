//! Shared fixtures for unit tests.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::PrivateKeyDer;
use rustls::sign::CertifiedKey;

use crate::addon::{Addon, Addons};
use crate::ca::{CaError, CertificateAuthority};
use crate::connection::ClientConn;
use crate::context::{ConnContext, ProxyState};
use crate::provision::CertificateProvisioner;
use crate::wrap::{Transport, WrapClientConn, WrapServerConn};

/// Transport that counts real closes and optionally fails them.
pub struct CountingTransport {
    closes: Arc<AtomicUsize>,
    fail: Option<io::ErrorKind>,
}

impl CountingTransport {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        (
            Self {
                closes: closes.clone(),
                fail: None,
            },
            closes,
        )
    }

    pub fn failing(kind: io::ErrorKind) -> (Self, Arc<AtomicUsize>) {
        let (mut transport, closes) = Self::new();
        transport.fail = Some(kind);
        (transport, closes)
    }
}

impl Transport for CountingTransport {
    fn close(&self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match self.fail {
            Some(kind) => Err(io::Error::new(kind, "close failed")),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct CountingAddon {
    pub server_connected: AtomicUsize,
    pub client_disconnected: AtomicUsize,
    pub server_disconnected: AtomicUsize,
}

impl Addon for CountingAddon {
    fn server_connected(&self, _ctx: &ConnContext) {
        self.server_connected.fetch_add(1, Ordering::SeqCst);
    }

    fn client_disconnected(&self, _client: &ClientConn) {
        self.client_disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn server_disconnected(&self, _ctx: &ConnContext) {
        self.server_disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct PanickingAddon;

impl Addon for PanickingAddon {
    fn server_connected(&self, _ctx: &ConnContext) {
        panic!("server_connected exploded");
    }

    fn client_disconnected(&self, _client: &ClientConn) {
        panic!("client_disconnected exploded");
    }
}

/// Authority returning one fixed key and recording every request.
pub struct RecordingAuthority {
    key: Arc<CertifiedKey>,
    issued: Mutex<Vec<String>>,
}

impl RecordingAuthority {
    pub fn new(name: &str) -> Self {
        let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        let key = PrivateKeyDer::Pkcs8(cert.signing_key.serialize_der().into());
        let signing_key = any_supported_type(&key).unwrap();
        Self {
            key: Arc::new(CertifiedKey::new(vec![cert.cert.der().clone()], signing_key)),
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &Arc<CertifiedKey> {
        &self.key
    }

    pub fn issued(&self) -> Vec<String> {
        self.issued.lock().clone()
    }
}

impl CertificateAuthority for RecordingAuthority {
    fn issue(&self, server_name: &str) -> Result<Arc<CertifiedKey>, CaError> {
        self.issued.lock().push(server_name.to_string());
        Ok(self.key.clone())
    }
}

/// A context over a counting transport, with upstream verification disabled.
pub fn context_with_authority(
    addons: Addons,
    authority: Arc<dyn CertificateAuthority>,
) -> (Arc<ConnContext>, Arc<AtomicUsize>) {
    let (transport, closes) = CountingTransport::new();
    let conn = WrapClientConn::new(Box::new(transport), "127.0.0.1:40000".parse().unwrap());
    let state = Arc::new(ProxyState::new(
        addons,
        CertificateProvisioner::new(authority, true),
    ));
    (ConnContext::new(conn, state), closes)
}

pub fn context_with(addons: Addons) -> (Arc<ConnContext>, Arc<AtomicUsize>) {
    context_with_authority(addons, Arc::new(RecordingAuthority::new("test.example")))
}

/// Attaches a server side over a counting transport; returns its close count.
pub fn attach_server(ctx: &Arc<ConnContext>, address: &str) -> Arc<AtomicUsize> {
    ctx.init_plain_server();
    let (transport, closes) = CountingTransport::new();
    let server = ctx.server_conn().unwrap();
    server.attach(WrapServerConn::new(
        Box::new(transport),
        address,
        Arc::downgrade(ctx),
    ));
    closes
}

/// Polls `check` for up to two seconds.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    check()
}
