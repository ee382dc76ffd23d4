//! Client session handling.
//!
//! Serves HTTP/1.1 on each accepted client. Plain requests are forwarded
//! through the plain dispatch client. `CONNECT` upgrades the connection and
//! sniffs the first byte: a TLS handshake is intercepted, anything else is
//! relayed as raw bytes.

use std::convert::Infallible;
use std::future::Future;
use std::pin::{pin, Pin};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::crypto::aws_lc_rs::default_provider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::context::{ConnContext, ProxyState};
use crate::dispatch::ProxyBody;
use crate::error::{ProxyError, Result};
use crate::greeting::{looks_like_tls, read_client_greeting};
use crate::rewind::Rewind;
use crate::upstream_tls::HTTP11_ALPN;
use crate::wrap::WrapClientConn;

const DEFAULT_TUNNEL_PORT: u16 = 443;

/// Serves one accepted client until its session ends, then closes it.
pub async fn serve_client(stream: TcpStream, conn: Arc<WrapClientConn>, state: Arc<ProxyState>) {
    let ctx = ConnContext::new(conn, state);
    tracing::debug!(
        client = %ctx.client_conn().id(),
        peer = %ctx.client_conn().peer_addr(),
        "Client connected"
    );

    let service_ctx = ctx.clone();
    let service = service_fn(move |req| handle_request(service_ctx.clone(), req));
    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    if let Err(e) = serve_until_drained(&ctx, conn, |conn| conn.graceful_shutdown()).await {
        tracing::debug!(client = %ctx.client_conn().id(), "Client connection error: {}", e);
    }

    // An upgraded session is closed by its tunnel task.
    if !ctx.is_upgraded() {
        let _ = ctx.client_conn().conn().close();
    }
}

/// Drives an HTTP server connection until it ends or the session drains.
///
/// On drain the connection finishes the response in flight and stops.
async fn serve_until_drained<C, T>(
    ctx: &ConnContext,
    conn: C,
    shutdown: impl FnOnce(Pin<&mut C>),
) -> T
where
    C: Future<Output = T>,
{
    let _serving = ctx.serving();
    let mut conn = pin!(conn);
    tokio::select! {
        result = conn.as_mut() => return result,
        _ = ctx.drained() => {}
    }
    tracing::debug!(client = %ctx.client_conn().id(), "Upstream gone, draining client");
    shutdown(conn.as_mut());
    conn.await
}

async fn handle_request(
    ctx: Arc<ConnContext>,
    req: Request<Incoming>,
) -> std::result::Result<Response<ProxyBody>, Infallible> {
    if req.method() == Method::CONNECT {
        return Ok(handle_connect(ctx, req));
    }
    ctx.init_plain_server();
    Ok(forward(&ctx, req).await)
}

fn handle_connect(ctx: Arc<ConnContext>, req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(authority) = req.uri().authority().cloned() else {
        return error_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
    };
    let target = match authority.port_u16() {
        Some(_) => authority.to_string(),
        None => format!("{}:{}", authority.host(), DEFAULT_TUNNEL_PORT),
    };
    tracing::debug!(client = %ctx.client_conn().id(), %target, "CONNECT");
    ctx.set_tunnel_target(target.clone());
    ctx.mark_upgraded();

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = run_tunnel(&ctx, upgraded).await {
                    tracing::warn!(%target, "Tunnel failed: {}", e);
                }
            }
            Err(e) => tracing::warn!(%target, "Upgrade failed: {}", e),
        }
        let _ = ctx.client_conn().conn().close();
    });

    Response::new(empty_body())
}

/// Sniffs the first tunneled byte and picks interception or raw relay.
async fn run_tunnel(ctx: &Arc<ConnContext>, upgraded: Upgraded) -> Result<()> {
    let mut client = TokioIo::new(upgraded);
    let mut first = [0u8; 1];
    if client.read(&mut first).await? == 0 {
        return Ok(());
    }

    if looks_like_tls(&first) {
        intercept_tls(ctx, client, &first).await
    } else {
        relay_raw(ctx, client, &first).await
    }
}

/// Terminates the client's TLS with a certificate mirroring the upstream's.
///
/// The tunnel target is dialed and its handshake run before the client's
/// handshake is answered. Requests inside the tunnel then go through the TLS
/// dispatch client over the already negotiated upstream stream. `head` holds
/// the sniffed bytes, which are replayed to the acceptor with the rest of
/// the ClientHello.
async fn intercept_tls<S>(ctx: &Arc<ConnContext>, mut client: S, head: &[u8]) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    ctx.client_conn().mark_tls();
    ctx.init_tunnel_server().await?;
    ctx.init_tls_server()?;

    let (greeting, raw) = read_client_greeting(&mut client, head).await?;
    let key = ctx.issue_certificate(&greeting).await?;

    let acceptor = TlsAcceptor::from(Arc::new(client_facing_config(key)?));
    let tls = acceptor.accept(Rewind::new(raw, client)).await?;
    tracing::debug!(client = %ctx.client_conn().id(), "Client TLS established");

    let service_ctx = ctx.clone();
    let service = service_fn(move |req| {
        let ctx = service_ctx.clone();
        async move { Ok::<_, Infallible>(forward(&ctx, req).await) }
    });
    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(tls), service);
    serve_until_drained(ctx, conn, |conn| conn.graceful_shutdown()).await?;
    Ok(())
}

/// Copies bytes both ways between the client and the tunnel target.
///
/// The client's end of input is passed on as a write shutdown, and the relay
/// keeps reading until the upstream is done. Once the upstream is done the
/// relay ends, whatever the client is still sending.
async fn relay_raw<S>(ctx: &Arc<ConnContext>, client: S, head: &[u8]) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server = ctx.init_tunnel_server().await?;
    let mut upstream = server.take_upstream().ok_or(ProxyError::NoServerConn)?;
    upstream.write_all(head).await?;

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = upstream.split();
    let to_upstream = async {
        tokio::io::copy(&mut client_read, &mut upstream_write).await?;
        upstream_write.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };
    let to_client = async {
        let received = tokio::io::copy(&mut upstream_read, &mut client_write).await?;
        client_write.flush().await?;
        Ok::<_, std::io::Error>(received)
    };
    let mut to_upstream = pin!(to_upstream);
    let mut to_client = pin!(to_client);

    let upstream_done = tokio::select! {
        received = to_client.as_mut() => Some(received?),
        sent = to_upstream.as_mut() => {
            sent?;
            None
        }
    };
    let received = match upstream_done {
        Some(received) => received,
        None => to_client.await?,
    };
    tracing::debug!(client = %ctx.client_conn().id(), received, "Raw tunnel finished");
    Ok(())
}

/// Sends a request upstream through the session's dispatch client.
///
/// Upstream failures become a 502 carrying the error text. Responses,
/// redirects included, are passed back untouched.
async fn forward(ctx: &Arc<ConnContext>, req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(server) = ctx.server_conn() else {
        return error_response(StatusCode::BAD_GATEWAY, "no upstream for this session");
    };
    let Some(client) = server.dispatch() else {
        return error_response(StatusCode::BAD_GATEWAY, "no upstream client for this session");
    };

    match client.send(req.map(|body| body.boxed())).await {
        Ok(response) => response.map(|body| body.boxed()),
        Err(e) => {
            tracing::warn!(client = %ctx.client_conn().id(), "Upstream request failed: {}", e);
            error_response(StatusCode::BAD_GATEWAY, &e.to_string())
        }
    }
}

/// Serves the certificate issued for this session.
#[derive(Debug)]
struct IssuedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for IssuedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

fn client_facing_config(key: Arc<CertifiedKey>) -> Result<ServerConfig> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(IssuedCert(key)));
    config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];
    Ok(config)
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full_body(content: String) -> ProxyBody {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message.to_string()));
    *response.status_mut() = status;
    response
}
