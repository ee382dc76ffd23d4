//! ClientHello capture.
//!
//! The intercepting side needs the client's offered versions and cipher
//! suites before it can talk to the upstream, so the ClientHello is read off
//! the wire and parsed here. The raw bytes read are handed back so they can be
//! replayed into the client-facing TLS acceptor.

use rustls::{CipherSuite, ProtocolVersion};
use tls_parser::{
    parse_tls_extensions, parse_tls_message_handshake, parse_tls_record_header, SNIType,
    TlsExtension, TlsMessage, TlsMessageHandshake, TlsRecordType,
};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, Result};

/// TLS record content type for handshake messages.
pub const HANDSHAKE_RECORD: u8 = 0x16;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;
const MAX_GREETING_LEN: usize = 64 * 1024;

/// Returns true if `head` starts like a TLS handshake record.
pub fn looks_like_tls(head: &[u8]) -> bool {
    head.first() == Some(&HANDSHAKE_RECORD)
}

/// GREASE values (RFC 8701) are placeholders, never real parameters.
fn is_grease(value: u16) -> bool {
    value & 0x0f0f == 0x0a0a && value >> 8 == value & 0xff
}

/// The parts of a ClientHello the proxy mirrors upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientGreeting {
    /// Requested server name (SNI host name).
    pub server_name: Option<String>,
    /// Offered cipher suites, in offered order.
    pub cipher_suites: Vec<CipherSuite>,
    /// Offered protocol versions, in offered order.
    pub supported_versions: Vec<ProtocolVersion>,
    /// Offered ALPN protocols.
    pub alpn_protocols: Vec<Vec<u8>>,
}

impl ClientGreeting {
    /// Parses a complete ClientHello handshake message, header included.
    pub fn parse(message: &[u8]) -> Result<Self> {
        let (_, parsed) = parse_tls_message_handshake(message)
            .map_err(|_| malformed("unparsable handshake message"))?;
        let TlsMessage::Handshake(TlsMessageHandshake::ClientHello(hello)) = parsed else {
            return Err(malformed("not a ClientHello"));
        };

        let mut greeting = ClientGreeting {
            cipher_suites: hello
                .ciphers
                .iter()
                .map(|suite| suite.0)
                .filter(|suite| !is_grease(*suite))
                .map(CipherSuite::from)
                .collect(),
            ..ClientGreeting::default()
        };

        // Extensions are optional in pre-1.3 hellos.
        if let Some(raw) = hello.ext {
            let (_, extensions) =
                parse_tls_extensions(raw).map_err(|_| malformed("unparsable extensions"))?;
            for extension in extensions {
                match extension {
                    TlsExtension::SNI(names) => greeting.server_name = host_name(&names)?,
                    TlsExtension::ALPN(protocols) => {
                        greeting.alpn_protocols =
                            protocols.iter().map(|protocol| protocol.to_vec()).collect()
                    }
                    TlsExtension::SupportedVersions(versions) => {
                        greeting.supported_versions = versions
                            .iter()
                            .map(|version| version.0)
                            .filter(|version| !is_grease(*version))
                            .map(ProtocolVersion::from)
                            .collect()
                    }
                    _ => {}
                }
            }
        }

        if greeting.supported_versions.is_empty() {
            greeting
                .supported_versions
                .push(ProtocolVersion::from(hello.version.0));
        }
        Ok(greeting)
    }
}

fn host_name(names: &[(SNIType, &[u8])]) -> Result<Option<String>> {
    let Some((_, name)) = names.iter().find(|(kind, _)| *kind == SNIType::HostName) else {
        return Ok(None);
    };
    let host = std::str::from_utf8(name).map_err(|_| malformed("server name is not UTF-8"))?;
    Ok(Some(host.to_string()))
}

fn malformed(reason: &str) -> ProxyError {
    ProxyError::Tls(format!("malformed ClientHello: {}", reason))
}

/// Reads handshake records from `stream` until a full ClientHello is seen.
///
/// `prefix` holds bytes already consumed from the stream (for example the
/// sniffed first byte). Returns the parsed greeting and every byte read,
/// prefix included, so the caller can replay them.
pub async fn read_client_greeting<S>(
    stream: &mut S,
    prefix: &[u8],
) -> Result<(ClientGreeting, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut raw = prefix.to_vec();
    let mut handshake = Vec::new();
    let mut offset = 0;

    loop {
        fill(stream, &mut raw, offset + RECORD_HEADER_LEN).await?;
        let (_, header) = parse_tls_record_header(&raw[offset..])
            .map_err(|_| malformed("unparsable record header"))?;
        if header.record_type != TlsRecordType::Handshake {
            return Err(malformed("expected a handshake record"));
        }

        let end = offset + RECORD_HEADER_LEN + usize::from(header.len);
        if end > MAX_GREETING_LEN {
            return Err(malformed("too large"));
        }
        fill(stream, &mut raw, end).await?;
        handshake.extend_from_slice(&raw[offset + RECORD_HEADER_LEN..end]);
        offset = end;

        if handshake.len() >= HANDSHAKE_HEADER_LEN {
            let message_len = HANDSHAKE_HEADER_LEN
                + (usize::from(handshake[1]) << 16
                    | usize::from(handshake[2]) << 8
                    | usize::from(handshake[3]));
            if message_len > MAX_GREETING_LEN {
                return Err(malformed("too large"));
            }
            if handshake.len() >= message_len {
                let greeting = ClientGreeting::parse(&handshake[..message_len])?;
                return Ok((greeting, raw));
            }
        }
    }
}

async fn fill<S>(stream: &mut S, buf: &mut Vec<u8>, want: usize) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    while buf.len() < want {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::Tls(
                "client closed the connection during the TLS greeting".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rustls::crypto::aws_lc_rs::default_provider;
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, ClientConnection, RootCertStore};

    use super::*;

    /// Produces the exact bytes a rustls client sends first.
    fn rustls_hello(name: &str, alpn: &[&[u8]]) -> Vec<u8> {
        let mut config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

        let server_name = ServerName::try_from(name.to_string()).unwrap();
        let mut conn = ClientConnection::new(Arc::new(config), server_name).unwrap();
        let mut out = Vec::new();
        conn.write_tls(&mut out).unwrap();
        out
    }

    /// A minimal ClientHello with no extensions.
    fn bare_hello(version: u16, suites: &[u16]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&version.to_be_bytes());
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
        for suite in suites {
            body.extend_from_slice(&suite.to_be_bytes());
        }
        body.extend_from_slice(&[1, 0]);

        let mut message = vec![0x01];
        message.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        message.extend_from_slice(&body);
        message
    }

    fn record(fragment: &[u8]) -> Vec<u8> {
        let mut out = vec![HANDSHAKE_RECORD, 0x03, 0x01];
        out.extend_from_slice(&(fragment.len() as u16).to_be_bytes());
        out.extend_from_slice(fragment);
        out
    }

    #[test]
    fn detects_handshake_records() {
        assert!(looks_like_tls(&[0x16, 0x03, 0x01]));
        assert!(!looks_like_tls(b"GET / HTTP/1.1"));
        assert!(!looks_like_tls(&[]));
    }

    #[test]
    fn grease_values() {
        assert!(is_grease(0x0a0a));
        assert!(is_grease(0xfafa));
        assert!(!is_grease(0x1301));
        assert!(!is_grease(0x0a1a));
    }

    #[test]
    fn parses_rustls_client_hello() {
        let wire = rustls_hello("a.example", &[b"h2", b"http/1.1"]);
        let greeting = ClientGreeting::parse(&wire[RECORD_HEADER_LEN..]).unwrap();

        assert_eq!(greeting.server_name.as_deref(), Some("a.example"));
        assert!(greeting
            .supported_versions
            .contains(&ProtocolVersion::TLSv1_3));
        assert!(greeting
            .supported_versions
            .contains(&ProtocolVersion::TLSv1_2));
        assert!(greeting
            .cipher_suites
            .contains(&CipherSuite::TLS13_AES_128_GCM_SHA256));
        assert_eq!(
            greeting.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn falls_back_to_legacy_version() {
        let greeting = ClientGreeting::parse(&bare_hello(0x0303, &[0xc02f, 0x0a0a])).unwrap();
        assert_eq!(greeting.supported_versions, vec![ProtocolVersion::TLSv1_2]);
        assert_eq!(
            greeting.cipher_suites,
            vec![CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256]
        );
        assert!(greeting.server_name.is_none());
        assert!(greeting.alpn_protocols.is_empty());
    }

    #[test]
    fn rejects_truncated_and_foreign_messages() {
        let hello = bare_hello(0x0303, &[0x1301]);
        assert!(ClientGreeting::parse(&hello[..hello.len() - 3]).is_err());

        let mut server_hello = hello.clone();
        server_hello[0] = 0x02;
        assert!(ClientGreeting::parse(&server_hello).is_err());
    }

    #[tokio::test]
    async fn reads_greeting_and_returns_raw_bytes() {
        let wire = rustls_hello("a.example", &[b"http/1.1"]);
        let mut stream = &wire[1..];

        let (greeting, raw) = read_client_greeting(&mut stream, &wire[..1]).await.unwrap();

        assert_eq!(greeting.server_name.as_deref(), Some("a.example"));
        assert_eq!(raw, wire);
    }

    #[tokio::test]
    async fn reassembles_fragmented_hello() {
        let message = bare_hello(0x0303, &[0x1301, 0x1302]);
        let (first, second) = message.split_at(10);
        let mut wire = record(first);
        wire.extend_from_slice(&record(second));
        let mut stream = wire.as_slice();

        let (greeting, raw) = read_client_greeting(&mut stream, &[]).await.unwrap();

        assert_eq!(greeting.cipher_suites.len(), 2);
        assert_eq!(raw, wire);
    }

    #[tokio::test]
    async fn early_eof_is_an_error() {
        let wire = rustls_hello("a.example", &[]);
        let mut stream = &wire[..20];
        assert!(read_client_greeting(&mut stream, &[]).await.is_err());
    }

    #[tokio::test]
    async fn non_handshake_record_is_an_error() {
        let mut stream: &[u8] = &[0x17, 0x03, 0x03, 0x00, 0x01, 0x00];
        assert!(read_client_greeting(&mut stream, &[]).await.is_err());
    }
}
