//! TCP/TLS listener and the per-connection session loop.

use crate::config::AppConfig;
use crate::ldap_handler::LdapHandler;
use crate::ldap_protocol::{encode_ldap_message, parse_ldap_message, LdapMessage, ProtocolOp};
use anyhow::{Context, Result};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// LDAP messages always open with a universal SEQUENCE.
const MESSAGE_SEQUENCE_TAG: u8 = 0x30;

pub struct LdapServer {
    handler: Arc<LdapHandler>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl LdapServer {
    pub fn new(config: Arc<AppConfig>, tls_acceptor: Option<TlsAcceptor>) -> Self {
        Self {
            handler: Arc::new(LdapHandler::new(config)),
            tls_acceptor,
        }
    }

    /// Bind the listener and accept connections until the process exits.
    /// A failed accept is logged and skipped, never fatal.
    pub async fn start(&self) -> Result<()> {
        let config = self.handler.config();
        let port = config.configuration.effective_port();
        let addr = SocketAddr::from(([0, 0, 0, 0], port));

        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to port {}", port))?;

        let conn_type = if self.tls_acceptor.is_some() {
            "TLS-connections"
        } else {
            "connections"
        };
        info!("Listening for {} on port {}", conn_type, port);
        info!(
            "Database contains {} user(s) and {} group(s)",
            config.users.len(),
            config.groups.len()
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New connection from {}", peer_addr);
                    let handler = Arc::clone(&self.handler);
                    let acceptor = self.tls_acceptor.clone();
                    tokio::spawn(async move {
                        let result = match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => run_session(tls_stream, handler).await,
                                Err(e) => {
                                    error!("TLS handshake failed for {}: {}", peer_addr, e);
                                    return;
                                }
                            },
                            None => run_session(stream, handler).await,
                        };
                        if let Err(e) = result {
                            error!("Error handling client {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Result of scanning the read buffer for one message frame.
enum Framing {
    /// Not enough data yet.
    Incomplete,
    /// The buffer starts with one complete message of this total length.
    Frame(usize),
    /// The leading bytes cannot start an LDAP message; drop this many and
    /// rescan.
    Skip(usize),
}

/// Frame on the outer SEQUENCE length prefix. Messages larger than one TCP
/// segment and multiple messages per segment both resolve here.
fn scan_frame(buffer: &[u8]) -> Framing {
    if buffer.len() < 2 {
        return Framing::Incomplete;
    }
    if buffer[0] != MESSAGE_SEQUENCE_TAG {
        return Framing::Skip(1);
    }

    let first = buffer[1];
    let total = if first & 0x80 == 0 {
        2 + first as usize
    } else {
        let count = (first & 0x7F) as usize;
        if count == 0 || count > 4 {
            // Indefinite or absurd length encoding; resync byte by byte.
            return Framing::Skip(1);
        }
        if buffer.len() < 2 + count {
            return Framing::Incomplete;
        }
        let mut length = 0usize;
        for &b in &buffer[2..2 + count] {
            length = (length << 8) | b as usize;
        }
        2 + count + length
    };

    if buffer.len() < total {
        Framing::Incomplete
    } else {
        Framing::Frame(total)
    }
}

/// Serve one connection: read, frame, dispatch, respond. Returns on unbind,
/// EOF, or a socket error (which the caller logs).
///
/// The bind flag starts false and only ever moves to true; a later failed
/// bind does not revoke an established bind on the same connection.
pub async fn run_session<S>(mut stream: S, handler: Arc<LdapHandler>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cid = Uuid::new_v4();
    let mut bind_successful = false;
    let mut buffer = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    info!("CID: {}, new connection, waiting for data", cid);

    loop {
        eprintln!("DEBUG: about to read");
        let n = stream
            .read(&mut chunk)
            .await
            .context("Failed to read request")?;
        eprintln!("DEBUG: read {} bytes", n);
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);

        loop {
            let frame_len = match scan_frame(&buffer) {
                Framing::Incomplete => break,
                Framing::Skip(count) => {
                    warn!("CID: {}, skipping {} non-conforming byte(s)", cid, count);
                    buffer.advance(count);
                    continue;
                }
                Framing::Frame(len) => len,
            };
            let frame = buffer.split_to(frame_len);

            let message = match parse_ldap_message(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!("CID: {}, unknown packet: {}", cid, e);
                    continue;
                }
            };

            info!(
                "CID: {}, message number {}, {} OP",
                cid,
                message.message_id,
                message.protocol_op.name()
            );

            match message.protocol_op {
                ProtocolOp::BindRequest(ref request) => {
                    let outcome = handler.handle_bind(request);
                    if outcome.bound {
                        bind_successful = true;
                    }
                    if let Some(result) = outcome.response {
                        let response = LdapMessage {
                            message_id: message.message_id,
                            protocol_op: ProtocolOp::BindResponse(result),
                        };
                        write_message(&mut stream, &response).await?;
                    }
                }
                ProtocolOp::UnbindRequest => {
                    info!("CID: {}, connection closed", cid);
                    return Ok(());
                }
                ProtocolOp::SearchRequest(ref request) => {
                    let responses =
                        handler.handle_search(message.message_id, request, bind_successful);
                    eprintln!("DEBUG: search produced {} responses", responses.len());
                    for response in &responses {
                        eprintln!("DEBUG: writing a response");
                        write_message(&mut stream, response).await?;
                        eprintln!("DEBUG: wrote a response");
                    }
                }
                ProtocolOp::DelRequest(ref request) => {
                    let result = handler.handle_delete(request);
                    let response = LdapMessage {
                        message_id: message.message_id,
                        protocol_op: ProtocolOp::DelResponse(result),
                    };
                    write_message(&mut stream, &response).await?;
                }
                ProtocolOp::Unsupported(tag) => {
                    warn!("CID: {}, unsupported OP (tag id: {})", cid, tag & 0x1F);
                }
                ref other => {
                    warn!("CID: {}, unexpected {} from client", cid, other.name());
                }
            }
        }
    }

    info!("CID: {}, connection closed", cid);
    Ok(())
}

async fn write_message<S>(stream: &mut S, message: &LdapMessage) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let data = encode_ldap_message(message)?;
    eprintln!("DEBUG: encoded {} bytes: {:02x?}", data.len(), &data[..data.len().min(8)]);
    stream
        .write_all(&data)
        .await
        .context("Failed to write response")?;
    stream.flush().await.context("Failed to flush response")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, Configuration, Group, User};
    use crate::ldap_handler::{DIAG_ACCOUNT_DISABLED, DIAG_BIND_REQUIRED, DIAG_INVALID_CREDENTIALS};
    use crate::ldap_protocol::test_support::*;
    use crate::ldap_protocol::{Attribute, LdapResult, SearchResultEntry};
    use std::collections::BTreeMap;
    use tokio::io::{duplex, DuplexStream};

    fn test_handler() -> Arc<LdapHandler> {
        let configuration = Configuration {
            domain: "example.com".to_string(),
            ..Configuration::default()
        };
        let users = vec![
            User {
                cn: "alice".to_string(),
                upn: "alice@example.com".to_string(),
                password: "pw".to_string(),
                password_never_expire: false,
                account_disabled: false,
                attributes: BTreeMap::new(),
                groups: vec!["admins".to_string()],
                user_account_control: 0,
            },
            User {
                cn: "mallory".to_string(),
                upn: "mallory@example.com".to_string(),
                password: "pw".to_string(),
                password_never_expire: false,
                account_disabled: true,
                attributes: BTreeMap::new(),
                groups: vec![],
                user_account_control: 0,
            },
        ];
        let groups = vec![Group {
            cn: "admins".to_string(),
        }];
        let config = AppConfig::assemble(configuration, users, groups).unwrap();
        Arc::new(LdapHandler::new(Arc::new(config)))
    }

    fn spawn_session() -> DuplexStream {
        let (client, server) = duplex(64 * 1024);
        tokio::spawn(run_session(server, test_handler()));
        client
    }

    /// Read one complete response frame from the client side.
    async fn read_frame(client: &mut DuplexStream) -> Vec<u8> {
        let mut buffer = BytesMut::new();
        let mut chunk = [0u8; 1024];
        loop {
            if let Framing::Frame(len) = scan_frame(&buffer) {
                return buffer.split_to(len).to_vec();
            }
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed while waiting for a response");
            buffer.extend_from_slice(&chunk[..n]);
        }
    }

    fn encoded(message_id: u8, protocol_op: ProtocolOp) -> Vec<u8> {
        encode_ldap_message(&LdapMessage {
            message_id,
            protocol_op,
        })
        .unwrap()
    }

    #[test]
    fn test_scan_frame_incomplete() {
        assert!(matches!(scan_frame(&[]), Framing::Incomplete));
        assert!(matches!(scan_frame(&[0x30]), Framing::Incomplete));
        assert!(matches!(scan_frame(&[0x30, 0x05, 0x02]), Framing::Incomplete));
        // Long form with missing length bytes.
        assert!(matches!(scan_frame(&[0x30, 0x82, 0x01]), Framing::Incomplete));
    }

    #[test]
    fn test_scan_frame_complete_and_oversized_buffer() {
        let frame = encode_bind_request(1, "a", "b");
        assert!(matches!(scan_frame(&frame), Framing::Frame(len) if len == frame.len()));

        let mut two = frame.clone();
        two.extend_from_slice(&frame);
        assert!(matches!(scan_frame(&two), Framing::Frame(len) if len == frame.len()));
    }

    #[test]
    fn test_scan_frame_long_form() {
        let mut data = vec![0x30, 0x82, 0x01, 0x00];
        data.extend(std::iter::repeat(0u8).take(256));
        assert!(matches!(scan_frame(&data), Framing::Frame(260)));
    }

    #[test]
    fn test_scan_frame_resync_on_garbage() {
        assert!(matches!(scan_frame(&[0x00, 0x30]), Framing::Skip(1)));
        assert!(matches!(scan_frame(&[0x30, 0x80, 0x00]), Framing::Skip(1)));
    }

    #[tokio::test]
    async fn test_anonymous_bind_then_search_is_rejected() {
        let mut client = spawn_session();

        client
            .write_all(&encode_bind_request(1, "", ""))
            .await
            .unwrap();
        let response = read_frame(&mut client).await;
        assert_eq!(
            response,
            encoded(1, ProtocolOp::BindResponse(LdapResult::success()))
        );

        client
            .write_all(&encode_search_request(2, "DC=example,DC=com", None))
            .await
            .unwrap();
        let response = read_frame(&mut client).await;
        assert_eq!(
            response,
            encoded(
                2,
                ProtocolOp::SearchResultDone(LdapResult::new(1, DIAG_BIND_REQUIRED))
            )
        );
    }

    #[tokio::test]
    async fn test_authenticated_search_returns_directory() {
        let mut client = spawn_session();

        client
            .write_all(&encode_bind_request(1, "ALICE@example.com", "pw"))
            .await
            .unwrap();
        assert_eq!(
            read_frame(&mut client).await,
            encoded(1, ProtocolOp::BindResponse(LdapResult::success()))
        );

        client
            .write_all(&encode_search_request(2, "DC=example,DC=com", None))
            .await
            .unwrap();

        let group_entry = SearchResultEntry {
            object_name: "CN=admins,CN=Users,DC=example,DC=com".to_string(),
            attributes: vec![
                Attribute::new("objectClass", vec!["top".to_string(), "group".to_string()]),
                Attribute::new("name", vec!["admins".to_string()]),
                Attribute::new("cn", vec!["admins".to_string()]),
            ],
        };
        assert_eq!(
            read_frame(&mut client).await,
            encoded(2, ProtocolOp::SearchResultEntry(group_entry))
        );

        let user_entry = SearchResultEntry {
            object_name: "CN=alice,CN=Users,DC=example,DC=com".to_string(),
            attributes: vec![
                Attribute::new(
                    "objectClass",
                    vec![
                        "top".to_string(),
                        "person".to_string(),
                        "organizationalPerson".to_string(),
                        "user".to_string(),
                    ],
                ),
                Attribute::new("name", vec!["alice".to_string()]),
                Attribute::new("userPrincipalName", vec!["alice@example.com".to_string()]),
                Attribute::new("cn", vec!["alice".to_string()]),
                Attribute::new(
                    "memberOf",
                    vec!["CN=admins,CN=Users,DC=example,DC=com".to_string()],
                ),
                Attribute::new("userAccountControl", vec!["512".to_string()]),
            ],
        };
        assert_eq!(
            read_frame(&mut client).await,
            encoded(2, ProtocolOp::SearchResultEntry(user_entry))
        );

        let disabled_entry = SearchResultEntry {
            object_name: "CN=mallory,CN=Users,DC=example,DC=com".to_string(),
            attributes: vec![
                Attribute::new(
                    "objectClass",
                    vec![
                        "top".to_string(),
                        "person".to_string(),
                        "organizationalPerson".to_string(),
                        "user".to_string(),
                    ],
                ),
                Attribute::new("name", vec!["mallory".to_string()]),
                Attribute::new("userPrincipalName", vec!["mallory@example.com".to_string()]),
                Attribute::new("cn", vec!["mallory".to_string()]),
                Attribute::new("userAccountControl", vec!["514".to_string()]),
            ],
        };
        assert_eq!(
            read_frame(&mut client).await,
            encoded(2, ProtocolOp::SearchResultEntry(disabled_entry))
        );

        assert_eq!(
            read_frame(&mut client).await,
            encoded(2, ProtocolOp::SearchResultDone(LdapResult::success()))
        );
    }

    #[tokio::test]
    async fn test_disabled_account_bind_rejected() {
        let mut client = spawn_session();

        client
            .write_all(&encode_bind_request(1, "mallory@example.com", "pw"))
            .await
            .unwrap();
        assert_eq!(
            read_frame(&mut client).await,
            encoded(
                1,
                ProtocolOp::BindResponse(LdapResult::new(49, DIAG_ACCOUNT_DISABLED))
            )
        );
    }

    #[tokio::test]
    async fn test_wrong_password_keeps_connection_unbound() {
        let mut client = spawn_session();

        client
            .write_all(&encode_bind_request(1, "alice@example.com", "bad"))
            .await
            .unwrap();
        assert_eq!(
            read_frame(&mut client).await,
            encoded(
                1,
                ProtocolOp::BindResponse(LdapResult::new(49, DIAG_INVALID_CREDENTIALS))
            )
        );

        client
            .write_all(&encode_search_request(2, "DC=example,DC=com", None))
            .await
            .unwrap();
        let response = read_frame(&mut client).await;
        assert_eq!(
            response,
            encoded(
                2,
                ProtocolOp::SearchResultDone(LdapResult::new(1, DIAG_BIND_REQUIRED))
            )
        );
    }

    #[tokio::test]
    async fn test_failed_rebind_does_not_revoke_session() {
        let mut client = spawn_session();

        client
            .write_all(&encode_bind_request(1, "alice@example.com", "pw"))
            .await
            .unwrap();
        read_frame(&mut client).await;

        client
            .write_all(&encode_bind_request(2, "alice@example.com", "bad"))
            .await
            .unwrap();
        assert_eq!(
            read_frame(&mut client).await,
            encoded(
                2,
                ProtocolOp::BindResponse(LdapResult::new(49, DIAG_INVALID_CREDENTIALS))
            )
        );

        // The earlier successful bind still stands.
        client
            .write_all(&encode_search_request(3, "DC=example,DC=com", None))
            .await
            .unwrap();
        let first = read_frame(&mut client).await;
        assert_eq!(first[5], 0x64, "expected a SearchResultEntry");
    }

    #[tokio::test]
    async fn test_search_filter_by_objectclass_group() {
        let mut client = spawn_session();

        client
            .write_all(&encode_bind_request(1, "alice@example.com", "pw"))
            .await
            .unwrap();
        read_frame(&mut client).await;

        let filter = equality_filter("objectClass", "group");
        client
            .write_all(&encode_search_request(2, "DC=example,DC=com", Some(&filter)))
            .await
            .unwrap();

        let first = read_frame(&mut client).await;
        assert_eq!(first[5], 0x64, "expected a SearchResultEntry");
        assert!(String::from_utf8_lossy(&first).contains("CN=admins,CN=Users"));

        assert_eq!(
            read_frame(&mut client).await,
            encoded(2, ProtocolOp::SearchResultDone(LdapResult::success()))
        );
    }

    #[tokio::test]
    async fn test_unbind_closes_without_response() {
        let mut client = spawn_session();

        client
            .write_all(&encode_unbind_request(1))
            .await
            .unwrap();

        let mut chunk = [0u8; 64];
        let n = client.read(&mut chunk).await.unwrap();
        assert_eq!(n, 0, "unbind must close the connection without a response");
    }

    #[tokio::test]
    async fn test_delete_is_acknowledged() {
        let mut client = spawn_session();

        client
            .write_all(&encode_delete_request(5, "CN=alice,CN=Users,DC=example,DC=com"))
            .await
            .unwrap();
        assert_eq!(
            read_frame(&mut client).await,
            encoded(5, ProtocolOp::DelResponse(LdapResult::success()))
        );
    }

    #[tokio::test]
    async fn test_request_split_across_reads() {
        let mut client = spawn_session();

        let request = encode_bind_request(1, "alice@example.com", "pw");
        let (head, tail) = request.split_at(5);
        client.write_all(head).await.unwrap();
        client.flush().await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(tail).await.unwrap();

        assert_eq!(
            read_frame(&mut client).await,
            encoded(1, ProtocolOp::BindResponse(LdapResult::success()))
        );
    }

    #[tokio::test]
    async fn test_two_requests_in_one_write() {
        let mut client = spawn_session();

        let mut batch = encode_bind_request(1, "alice@example.com", "pw");
        batch.extend(encode_search_request(2, "DC=wrong,DC=evil", None));
        client.write_all(&batch).await.unwrap();

        assert_eq!(
            read_frame(&mut client).await,
            encoded(1, ProtocolOp::BindResponse(LdapResult::success()))
        );
        let referral = read_frame(&mut client).await;
        assert_eq!(referral[5], 0x65, "expected a SearchResultDone");
        assert!(String::from_utf8_lossy(&referral).contains("0000202B: RefErr"));
    }

    #[tokio::test]
    async fn test_unsupported_op_keeps_connection_open() {
        let mut client = spawn_session();

        // ModifyRequest [APPLICATION 6]: logged, no response.
        let mut w = crate::ldap_protocol::BerWriter::new();
        let msg = w.begin_sequence();
        w.write_integer(1);
        w.write_primitive(0x66, &[]);
        w.end_constructed(msg);
        client.write_all(&w.into_bytes()).await.unwrap();

        client
            .write_all(&encode_bind_request(2, "alice@example.com", "pw"))
            .await
            .unwrap();
        assert_eq!(
            read_frame(&mut client).await,
            encoded(2, ProtocolOp::BindResponse(LdapResult::success()))
        );
    }

    #[tokio::test]
    async fn test_garbage_bytes_resync() {
        let mut client = spawn_session();

        let mut data = vec![0x00, 0x04, 0x01];
        data.extend(encode_bind_request(1, "alice@example.com", "pw"));
        client.write_all(&data).await.unwrap();

        assert_eq!(
            read_frame(&mut client).await,
            encoded(1, ProtocolOp::BindResponse(LdapResult::success()))
        );
    }
}
