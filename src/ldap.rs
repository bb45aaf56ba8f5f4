//! LDAP Server
//!
//! # RFC Compliance Status
//!
//! ## Implemented Operations (RFC 4511)
//! All request types are decoded and routed to the connection's [`Handler`]:
//! Bind (simple and SASL), Unbind, Search, Modify, Add, Delete, ModifyDN,
//! Compare, Abandon and Extended. Operations a handler does not implement are
//! answered with a result code, never dropped.
//!
//! ## Known Limitations
//! - Controls are parsed but none are implemented; a critical one fails the
//!   operation with unavailableCriticalExtension
//! - Abandon is accepted and ignored, since operations on one connection never overlap
//! - StartTLS is left to the handler; use [`LdapServer::run_with_tls`] for LDAPS
//!
//! ## Concurrency
//! Every accepted connection runs in its own task with its own handler
//! instance. Within a connection, requests are processed strictly in order.
//! On shutdown the listener stops accepting, idle sessions are sent a Notice
//! of Disconnection and sessions in the middle of an operation finish it first.
//!
//! ## TLS Connection Handling
//! - Gracefully handles improper TLS connection closures (missing `close_notify` alerts)
//! - Such closures are logged at debug level but don't trigger errors
//!
//! [`Handler`]: crate::handler::Handler

use rustls::ServerConfig;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{AppError, Result};
use crate::handler::{ConnectionInfo, HandlerFactory};
use crate::session::handle_connection;

/// Listener and per-connection settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOptions {
    /// Set TCP_NODELAY on accepted sockets
    pub nodelay: bool,
    /// Listen backlog
    pub backlog: u32,
    /// Largest LDAPMessage accepted from a client, in bytes
    pub max_message_size: usize,
    /// Time a client gets to complete the TLS handshake
    pub tls_handshake_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            backlog: 128,
            max_message_size: 1024 * 1024,
            tls_handshake_timeout: Duration::from_secs(10),
        }
    }
}

pub struct LdapServer<F> {
    factory: F,
    options: ServerOptions,
    next_connection_id: AtomicU64,
}

impl<F: HandlerFactory> LdapServer<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            options: ServerOptions::default(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Binds a listening socket with the configured backlog
    pub async fn bind(&self, addr: &str) -> Result<TcpListener> {
        let socket_addr = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| AppError::Config(format!("Cannot resolve LDAP address {}", addr)))?;

        let socket = if socket_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket
            .bind(socket_addr)
            .map_err(|e| AppError::Internal(format!("Failed to bind LDAP server: {}", e)))?;

        Ok(socket.listen(self.options.backlog)?)
    }

    /// Start the LDAP server
    pub async fn run(&self, addr: &str) -> Result<()> {
        let listener = self.bind(addr).await?;
        self.serve(listener, None, std::future::pending()).await
    }

    /// Start the LDAP server with TLS
    pub async fn run_with_tls(&self, addr: &str, tls_config: Arc<ServerConfig>) -> Result<()> {
        let listener = self.bind(addr).await?;
        self.serve(listener, Some(tls_config), std::future::pending())
            .await
    }

    /// Accepts connections on `listener` until `shutdown` completes
    ///
    /// Returns once every session has ended.
    pub async fn serve<S>(
        &self,
        listener: TcpListener,
        tls_config: Option<Arc<ServerConfig>>,
        shutdown: S,
    ) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let acceptor = tls_config.map(TlsAcceptor::from);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        info!(
            "LDAP server{} listening on {}",
            if acceptor.is_some() { " with TLS" } else { "" },
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown address".to_string())
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        if self.options.nodelay {
                            if let Err(e) = socket.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                            }
                        }

                        let info = ConnectionInfo {
                            id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
                            peer: Some(peer),
                            tls: acceptor.is_some(),
                        };
                        let span = info_span!("ldap_session", id = info.id, peer = %peer, tls = info.tls);
                        let handler = self.factory.create(&info);
                        let acceptor = acceptor.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        let max_message_size = self.options.max_message_size;
                        let handshake_timeout = self.options.tls_handshake_timeout;

                        sessions.spawn(
                            async move {
                                debug!("New LDAP connection");
                                let result = match acceptor {
                                    Some(acceptor) => {
                                        let mut shutdown_rx = shutdown_rx;
                                        let handshake = tokio::time::timeout(
                                            handshake_timeout,
                                            acceptor.accept(socket),
                                        );
                                        let stream = tokio::select! {
                                            accepted = handshake => match accepted {
                                                Ok(Ok(stream)) => stream,
                                                Ok(Err(e)) => {
                                                    warn!("TLS handshake failed: {}", e);
                                                    return;
                                                }
                                                Err(_) => {
                                                    warn!("TLS handshake timed out after {:?}", handshake_timeout);
                                                    return;
                                                }
                                            },
                                            _ = shutdown_rx.changed() => {
                                                debug!("Dropping connection during TLS handshake for shutdown");
                                                return;
                                            }
                                        };
                                        handle_connection(stream, handler, max_message_size, shutdown_rx)
                                            .await
                                    }
                                    None => {
                                        handle_connection(socket, handler, max_message_size, shutdown_rx)
                                            .await
                                    }
                                };
                                match result {
                                    Ok(()) => debug!("LDAP connection closed"),
                                    Err(e) => error!("Error handling LDAP connection: {}", e),
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        error!("Failed to accept LDAP connection: {}", e);
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("LDAP session task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        info!(
            "LDAP server shutting down, waiting for {} sessions",
            sessions.len()
        );
        let _ = shutdown_tx.send(true);
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!("LDAP session task failed: {}", e);
            }
        }
        info!("LDAP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    use crate::filter::Filter;
    use crate::handler::{Handler, SearchResults};
    use crate::ldap_lib::{
        encode_boolean, encode_integer, encode_message, encode_octet_string, encode_tlv,
        frame_length, tag, BerReader,
    };
    use crate::models::{DerefAliases, Entry, Scope};
    use crate::result::LdapError;
    use crate::tls::load_tls_config;

    struct Anonymous;

    #[async_trait]
    impl Handler for Anonymous {}

    /// Answers every search with `count` entries named cn=0 .. cn=count-1
    struct Numbered {
        count: usize,
    }

    #[async_trait]
    impl Handler for Numbered {
        async fn search(
            &mut self,
            base: &str,
            _scope: Scope,
            _deref: DerefAliases,
            _filter: &Filter,
            results: &mut SearchResults<'_>,
        ) -> std::result::Result<(), LdapError> {
            for i in 0..self.count {
                results.send_entry(&Entry::new(format!("cn={},{}", i, base))).await?;
                tokio::task::yield_now().await;
            }
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Frame {
        id: i64,
        op: u8,
        dn: Option<String>,
        code: Option<i64>,
    }

    struct Client {
        stream: TcpStream,
        buf: Vec<u8>,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                buf: Vec::new(),
            }
        }

        async fn next(&mut self) -> Frame {
            loop {
                if let Some(len) = frame_length(&self.buf, 1 << 20).unwrap() {
                    let frame: Vec<u8> = self.buf.drain(..len).collect();
                    let mut outer = BerReader::new(&frame);
                    let mut msg = BerReader::new(outer.expect(tag::SEQUENCE).unwrap());
                    let id = msg.read_integer(tag::INTEGER).unwrap();
                    let op = msg.read_tlv().unwrap();
                    let mut body = BerReader::new(op.value);
                    let (dn, code) = if op.tag == tag::SEARCH_RESULT_ENTRY {
                        (Some(body.read_string(tag::OCTET_STRING).unwrap()), None)
                    } else {
                        (None, Some(body.read_integer(tag::ENUMERATED).unwrap()))
                    };
                    return Frame {
                        id,
                        op: op.tag,
                        dn,
                        code,
                    };
                }
                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "Connection closed before the response was complete");
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    fn subtree_search(message_id: u32, base: &str) -> Vec<u8> {
        let mut body = encode_octet_string(base.as_bytes());
        body.extend(encode_integer(tag::ENUMERATED, 2));
        body.extend(encode_integer(tag::ENUMERATED, 0));
        body.extend(encode_integer(tag::INTEGER, 0));
        body.extend(encode_integer(tag::INTEGER, 0));
        body.extend(encode_boolean(false));
        body.extend(encode_tlv(tag::FILTER_PRESENT, b"objectClass"));
        body.extend(encode_tlv(tag::SEQUENCE, &[]));
        encode_message(message_id, &encode_tlv(tag::SEARCH_REQUEST, &body))
    }

    fn fixture_tls() -> Arc<ServerConfig> {
        load_tls_config(
            concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/server.crt"),
            concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/server.key"),
        )
        .unwrap()
    }

    fn anonymous_bind(message_id: u32) -> Vec<u8> {
        let mut body = encode_integer(tag::INTEGER, 3);
        body.extend(encode_octet_string(b""));
        body.extend(encode_tlv(0x80, b""));
        encode_message(message_id, &encode_tlv(tag::BIND_REQUEST, &body))
    }

    #[tokio::test]
    async fn test_bind_and_serve_until_shutdown() {
        let server = LdapServer::new(|_: &ConnectionInfo| Anonymous).with_options(ServerOptions {
            backlog: 16,
            ..ServerOptions::default()
        });
        let listener = server.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            server
                .serve(listener, None, async {
                    let _ = rx.await;
                })
                .await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&anonymous_bind(1)).await.unwrap();
        let mut response = [0u8; 14];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[5], tag::BIND_RESPONSE);
        assert_eq!(response[9], 0); // success

        tx.send(()).unwrap();
        // the idle session is told the server is going away
        let mut notice = Vec::new();
        client.read_to_end(&mut notice).await.unwrap();
        assert_eq!(notice[0], tag::SEQUENCE);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_rejects_address_without_port() {
        let server = LdapServer::new(|_: &ConnectionInfo| Anonymous);
        assert!(server.bind("127.0.0.1").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sessions_keep_entry_order() {
        const SESSIONS: usize = 32;
        const SEARCHES: u32 = 5;
        const ENTRIES: usize = 25;

        let server = LdapServer::new(|_: &ConnectionInfo| Numbered { count: ENTRIES });
        let listener = server.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .serve(listener, None, async {
                    let _ = rx.await;
                })
                .await
        });

        let mut clients = JoinSet::new();
        for session in 0..SESSIONS {
            clients.spawn(async move {
                let base = format!("ou=s{},dc=example,dc=com", session);
                let mut client = Client::connect(addr).await;
                for id in 1..=SEARCHES {
                    client
                        .stream
                        .write_all(&subtree_search(id, &base))
                        .await
                        .unwrap();
                    for i in 0..ENTRIES {
                        let frame = client.next().await;
                        assert_eq!(frame.id, id as i64);
                        assert_eq!(frame.op, tag::SEARCH_RESULT_ENTRY);
                        assert_eq!(frame.dn, Some(format!("cn={},{}", i, base)));
                    }
                    let done = client.next().await;
                    assert_eq!(done.id, id as i64);
                    assert_eq!(done.op, tag::SEARCH_RESULT_DONE);
                    assert_eq!(done.code, Some(0));
                }
            });
        }
        while let Some(joined) = clients.join_next().await {
            joined.unwrap();
        }

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_does_not_wait_for_stalled_tls_handshake() {
        let server = LdapServer::new(|_: &ConnectionInfo| Anonymous);
        let listener = server.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .serve(listener, Some(fixture_tls()), async {
                    let _ = rx.await;
                })
                .await
        });

        // connects but never sends a ClientHello
        let _silent = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("Server should stop while a handshake is pending")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_tls_handshake_timeout_drops_connection() {
        let server = LdapServer::new(|_: &ConnectionInfo| Anonymous).with_options(ServerOptions {
            tls_handshake_timeout: Duration::from_millis(200),
            ..ServerOptions::default()
        });
        let listener = server.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .serve(listener, Some(fixture_tls()), async {
                    let _ = rx.await;
                })
                .await
        });

        let mut silent = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(3), silent.read_to_end(&mut buf)).await;
        assert!(read.is_ok(), "Server should close a connection that never handshakes");
        assert!(buf.is_empty());

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
