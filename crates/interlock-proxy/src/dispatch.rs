//! Upstream HTTP/1.1 dispatch.
//!
//! Each server connection owns one [`DispatchClient`]. The plain client dials
//! the request's address itself; the TLS client reuses the stream negotiated by
//! the certificate flow. Neither follows redirects nor touches the response
//! body encoding.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

use crate::context::ConnContext;
use crate::error::{ProxyError, Result};
use crate::wrap::WrapServerConn;

/// Body type used on both sides of the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const DEFAULT_HTTP_PORT: u16 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Plain,
    Tls,
}

/// HTTP/1.1 client bound to one session's server side.
pub struct DispatchClient {
    ctx: Weak<ConnContext>,
    mode: Mode,
    senders: Mutex<HashMap<String, SendRequest<ProxyBody>>>,
}

impl fmt::Debug for DispatchClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchClient")
            .field("mode", &self.mode)
            .finish()
    }
}

impl DispatchClient {
    pub(crate) fn plain(ctx: Weak<ConnContext>) -> Self {
        Self::new(ctx, Mode::Plain)
    }

    pub(crate) fn tls(ctx: Weak<ConnContext>) -> Self {
        Self::new(ctx, Mode::Tls)
    }

    fn new(ctx: Weak<ConnContext>, mode: Mode) -> Self {
        Self {
            ctx,
            mode,
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if this client speaks TLS upstream.
    pub fn is_tls(&self) -> bool {
        self.mode == Mode::Tls
    }

    /// Sends `req` upstream and returns the response as received.
    pub async fn send(&self, mut req: Request<ProxyBody>) -> Result<Response<Incoming>> {
        let ctx = self.ctx.upgrade().ok_or(ProxyError::NoServerConn)?;
        req.headers_mut().remove("proxy-connection");

        let address = match self.mode {
            Mode::Plain => into_origin_form(&mut req, DEFAULT_HTTP_PORT)?,
            Mode::Tls => {
                if req.uri().authority().is_some() {
                    into_origin_form(&mut req, 443)?;
                }
                ctx.server_conn()
                    .and_then(|server| server.address())
                    .ok_or(ProxyError::NoServerConn)?
            }
        };

        let mut senders = self.senders.lock().await;
        if senders.get(&address).map_or(true, SendRequest::is_closed) {
            let sender = self.connect(&ctx, &address).await?;
            senders.insert(address.clone(), sender);
        }
        let sender = senders
            .get_mut(&address)
            .ok_or(ProxyError::NoServerConn)?;

        sender.ready().await?;
        Ok(sender.send_request(req).await?)
    }

    async fn connect(
        &self,
        ctx: &Arc<ConnContext>,
        address: &str,
    ) -> Result<SendRequest<ProxyBody>> {
        let server = ctx.server_conn().ok_or(ProxyError::NoServerConn)?;
        match self.mode {
            Mode::Plain => {
                let (stream, conn) = ctx.connect_server(&server, address).await?;
                ctx.addons().server_connected(ctx);
                handshake(stream, conn).await
            }
            Mode::Tls => {
                server.tls_state().await?;
                let stream = server.take_tls_stream().ok_or_else(|| {
                    ProxyError::Tls(format!("upstream TLS connection to {} is gone", address))
                })?;
                let conn = server.conn().ok_or(ProxyError::NoServerConn)?;
                handshake(stream, conn).await
            }
        }
    }
}

/// Starts an HTTP/1.1 client over `stream`.
///
/// The connection task closes `wrapper` when the upstream connection ends,
/// which reports the disconnect and, for the live connection, winds the
/// client side down.
async fn handshake<S>(stream: S, wrapper: Arc<WrapServerConn>) -> Result<SendRequest<ProxyBody>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::Builder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(stream))
        .await?;

    tokio::spawn(async move {
        match conn.await {
            Ok(()) => tracing::debug!(address = %wrapper.address(), "Upstream connection closed"),
            Err(e) => {
                tracing::debug!(address = %wrapper.address(), "Upstream connection ended: {}", e)
            }
        }
        let _ = wrapper.close();
    });
    Ok(sender)
}

/// Rewrites an absolute-form request to origin-form and returns `host:port`.
fn into_origin_form<B>(req: &mut Request<B>, default_port: u16) -> Result<String> {
    let uri = req.uri().clone();
    if uri.scheme_str() == Some("https") && default_port == DEFAULT_HTTP_PORT {
        return Err(ProxyError::InvalidRequest(format!(
            "'{}' must be requested through CONNECT",
            uri
        )));
    }
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::InvalidRequest(format!("no host in '{}'", uri)))?;
    let address = format!("{}:{}", host, uri.port_u16().unwrap_or(default_port));

    if !req.headers().contains_key(HOST) {
        if let Some(authority) = uri.authority() {
            let value = HeaderValue::from_str(authority.as_str())
                .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
            req.headers_mut().insert(HOST, value);
        }
    }

    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    *req.uri_mut() = path
        .parse::<Uri>()
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
    Ok(address)
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use http_body_util::{BodyExt, Empty};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::addon::Addons;
    use crate::error::HandshakeError;
    use crate::test_support::{
        context_with, context_with_authority, eventually, CountingAddon, RecordingAuthority,
    };

    fn request(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    fn empty() -> ProxyBody {
        Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed()
    }

    #[tokio::test]
    async fn upstream_close_pairs_connect_with_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nOKBODY")
                .await
                .unwrap();
        });

        let counter = Arc::new(CountingAddon::default());
        let (ctx, closes) = context_with(Addons::new().with(counter.clone()));
        ctx.init_plain_server();
        let server = ctx.server_conn().unwrap();

        let req = Request::builder()
            .uri(format!("http://{}/", address))
            .body(empty())
            .unwrap();
        let response = server.dispatch().unwrap().send(req).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OKBODY");

        assert!(eventually(|| counter.server_disconnected.load(Ordering::SeqCst) == 1).await);
        assert_eq!(counter.server_connected.load(Ordering::SeqCst), 1);
        assert!(server.conn().unwrap().is_closed());

        // Nothing serves the client here, so it is closed outright.
        assert!(eventually(|| closes.load(Ordering::SeqCst) == 1).await);
        assert_eq!(counter.client_disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tls_dispatch_waits_for_the_handshake_outcome() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let authority = Arc::new(RecordingAuthority::new("a.example"));
        let (ctx, _closes) = context_with_authority(Addons::new(), authority.clone());
        ctx.set_tunnel_target(listener.local_addr().unwrap().to_string());
        ctx.client_conn().mark_tls();
        let server = ctx.init_tunnel_server().await.unwrap();
        ctx.init_tls_server().unwrap();

        let dispatching = server.clone();
        let pending = tokio::spawn(async move {
            let req = Request::builder()
                .uri("/")
                .header(HOST, "a.example")
                .body(empty())
                .unwrap();
            dispatching.dispatch().unwrap().send(req).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        let cached = HandshakeError::new(io::ErrorKind::ConnectionRefused, "upstream refused");
        assert!(server.handshake().fire(Err(cached.clone())));

        match pending.await.unwrap() {
            Err(ProxyError::Handshake(err)) => assert_eq!(err, cached),
            other => panic!("unexpected dispatch result: {:?}", other),
        }
        // The dial never ran its own handshake or certificate flow.
        assert!(server.take_upstream().is_some());
        assert!(authority.issued().is_empty());
    }

    #[test]
    fn absolute_form_becomes_origin_form() {
        let mut req = request("http://a.example:8080/path?q=1");
        let address = into_origin_form(&mut req, DEFAULT_HTTP_PORT).unwrap();

        assert_eq!(address, "a.example:8080");
        assert_eq!(req.uri(), "/path?q=1");
        assert_eq!(req.headers()[HOST], "a.example:8080");
    }

    #[test]
    fn default_port_and_root_path() {
        let mut req = request("http://a.example");
        let address = into_origin_form(&mut req, DEFAULT_HTTP_PORT).unwrap();
        assert_eq!(address, "a.example:80");
        assert_eq!(req.uri(), "/");
    }

    #[test]
    fn existing_host_header_is_kept() {
        let mut req = Request::builder()
            .uri("http://10.0.0.1/")
            .header(HOST, "a.example")
            .body(())
            .unwrap();
        into_origin_form(&mut req, DEFAULT_HTTP_PORT).unwrap();
        assert_eq!(req.headers()[HOST], "a.example");
    }

    #[test]
    fn plain_https_and_origin_form_are_rejected() {
        assert!(into_origin_form(&mut request("https://a.example/"), DEFAULT_HTTP_PORT).is_err());
        assert!(into_origin_form(&mut request("/only-a-path"), DEFAULT_HTTP_PORT).is_err());
    }

    #[test]
    fn ipv6_hosts_keep_brackets() {
        let mut req = request("http://[::1]:8080/");
        assert_eq!(
            into_origin_form(&mut req, DEFAULT_HTTP_PORT).unwrap(),
            "[::1]:8080"
        );
    }
}
