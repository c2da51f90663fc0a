// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC listener accepting links from other cluster nodes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{Endpoint, Incoming, ServerConfig, TransportConfig};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::channel::{InboundHandler, NetworkChannel};
use crate::frame::{Frame, FrameError, MessageType, read_frame, write_frame};
use crate::proto::{AuthResult, NodeAuth, PROTOCOL_VERSION};

/// Grace period for in-flight frames before the QUIC connection is torn down
/// after its channel closed.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Errors that can occur in the QUIC server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("handshake timed out after {0}ms")]
    HandshakeTimeout(u64),

    #[error("unexpected {0:?} frame during handshake")]
    UnexpectedFrame(MessageType),

    #[error("node {node} rejected: {reason}")]
    Rejected { node: String, reason: String },

    #[error("node {node} could not be bound: {reason}")]
    Unbound { node: String, reason: String },
}

/// Configuration for the QUIC server
#[derive(Debug, Clone)]
pub struct ClusterServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// TLS certificate chain (PEM format)
    pub cert_pem: Vec<u8>,
    /// TLS private key (PEM format)
    pub key_pem: Vec<u8>,
    /// Maximum pending incoming connections (handshakes in progress)
    pub max_incoming: u32,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Server-side keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// Time a dialing node has to authenticate
    pub handshake_timeout_ms: u64,
    /// UDP receive buffer size in bytes (0 for OS default)
    pub udp_receive_buffer_size: usize,
    /// UDP send buffer size in bytes (0 for OS default)
    pub udp_send_buffer_size: usize,
    /// Maximum concurrent connection handlers (0 for unlimited)
    pub max_concurrent_handlers: u32,
}

impl Default for ClusterServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1410)),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            max_incoming: 1_000,
            idle_timeout_ms: 60_000,
            keep_alive_interval_ms: 10_000,
            handshake_timeout_ms: 10_000,
            udp_receive_buffer_size: 2 * 1024 * 1024, // 2MB
            udp_send_buffer_size: 2 * 1024 * 1024,    // 2MB
            max_concurrent_handlers: 0,               // unlimited by default
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ClusterServerConfig {
    /// Create a configuration from environment variables with defaults.
    ///
    /// Environment variables:
    /// - `CLOUDNET_QUIC_MAX_INCOMING`: Max pending handshakes (default: 1000)
    /// - `CLOUDNET_QUIC_IDLE_TIMEOUT_MS`: Idle timeout in ms (default: 60000)
    /// - `CLOUDNET_QUIC_KEEP_ALIVE_MS`: Keep-alive interval in ms, 0 to disable (default: 10000)
    /// - `CLOUDNET_QUIC_HANDSHAKE_TIMEOUT_MS`: Authentication deadline in ms (default: 10000)
    /// - `CLOUDNET_QUIC_UDP_RECV_BUFFER`: UDP receive buffer size in bytes (default: 2097152)
    /// - `CLOUDNET_QUIC_UDP_SEND_BUFFER`: UDP send buffer size in bytes (default: 2097152)
    /// - `CLOUDNET_QUIC_MAX_HANDLERS`: Max concurrent connection handlers, 0 for unlimited (default: 0)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            bind_addr: default.bind_addr,
            cert_pem: default.cert_pem,
            key_pem: default.key_pem,
            max_incoming: env_or("CLOUDNET_QUIC_MAX_INCOMING", default.max_incoming),
            idle_timeout_ms: env_or("CLOUDNET_QUIC_IDLE_TIMEOUT_MS", default.idle_timeout_ms),
            keep_alive_interval_ms: env_or(
                "CLOUDNET_QUIC_KEEP_ALIVE_MS",
                default.keep_alive_interval_ms,
            ),
            handshake_timeout_ms: env_or(
                "CLOUDNET_QUIC_HANDSHAKE_TIMEOUT_MS",
                default.handshake_timeout_ms,
            ),
            udp_receive_buffer_size: env_or(
                "CLOUDNET_QUIC_UDP_RECV_BUFFER",
                default.udp_receive_buffer_size,
            ),
            udp_send_buffer_size: env_or(
                "CLOUDNET_QUIC_UDP_SEND_BUFFER",
                default.udp_send_buffer_size,
            ),
            max_concurrent_handlers: env_or(
                "CLOUDNET_QUIC_MAX_HANDLERS",
                default.max_concurrent_handlers,
            ),
        }
    }
}

/// QUIC server accepting node links
pub struct ClusterServer {
    endpoint: Endpoint,
    config: ClusterServerConfig,
}

impl ClusterServer {
    /// Create a new server with the given configuration
    pub fn new(config: ClusterServerConfig) -> Result<Self, ServerError> {
        use socket2::{Domain, Protocol, Socket, Type};

        let server_config = Self::build_server_config(&config)?;

        let domain = if config.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if config.udp_receive_buffer_size > 0
            && let Err(e) = socket.set_recv_buffer_size(config.udp_receive_buffer_size)
        {
            warn!(
                size = config.udp_receive_buffer_size,
                error = %e,
                "Failed to set UDP receive buffer size"
            );
        }
        if config.udp_send_buffer_size > 0
            && let Err(e) = socket.set_send_buffer_size(config.udp_send_buffer_size)
        {
            warn!(
                size = config.udp_send_buffer_size,
                error = %e,
                "Failed to set UDP send buffer size"
            );
        }

        socket.bind(&config.bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();

        let runtime = quinn::default_runtime()
            .ok_or_else(|| ServerError::Bind(std::io::Error::other("no async runtime found")))?;
        let endpoint = Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(server_config),
            runtime.wrap_udp_socket(std_socket)?,
            runtime,
        )?;

        info!(
            addr = %config.bind_addr,
            max_incoming = config.max_incoming,
            idle_timeout_ms = config.idle_timeout_ms,
            keep_alive_ms = config.keep_alive_interval_ms,
            max_handlers = config.max_concurrent_handlers,
            "QUIC server bound"
        );

        Ok(Self { endpoint, config })
    }

    /// Create a server with self-signed certificate for local development
    pub fn localhost(bind_addr: SocketAddr) -> Result<Self, ServerError> {
        Self::localhost_with_config(bind_addr, ClusterServerConfig::from_env())
    }

    /// Create a server with self-signed certificate and custom config
    pub fn localhost_with_config(
        bind_addr: SocketAddr,
        mut config: ClusterServerConfig,
    ) -> Result<Self, ServerError> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        config.bind_addr = bind_addr;
        config.cert_pem = cert.cert.pem().into_bytes();
        config.key_pem = cert.key_pair.serialize_pem().into_bytes();

        Self::new(config)
    }

    pub fn config(&self) -> &ClusterServerConfig {
        &self.config
    }

    fn build_server_config(config: &ClusterServerConfig) -> Result<ServerConfig, ServerError> {
        let certs = rustls_pemfile::certs(&mut config.cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::Tls(format!("failed to parse certificates: {}", e)))?;

        let key = rustls_pemfile::private_key(&mut config.key_pem.as_slice())
            .map_err(|e| ServerError::Tls(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| ServerError::Tls("no private key found".to_string()))?;

        let crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(
            Duration::from_millis(config.idle_timeout_ms)
                .try_into()
                .map_err(|_| ServerError::Tls("idle timeout out of range".to_string()))?,
        ));
        // one channel stream per link
        transport.max_concurrent_bidi_streams(1u32.into());
        transport.max_concurrent_uni_streams(0u32.into());

        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
                .map_err(|e| ServerError::Tls(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(transport));
        server_config.max_incoming(config.max_incoming as usize);

        Ok(server_config)
    }

    /// Accept the next incoming connection
    pub async fn accept(&self) -> Option<Incoming> {
        self.endpoint.accept().await
    }

    /// Get the local address the server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Close the server
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closing");
    }

    /// Run the accept loop with a connection handler until the endpoint closes
    #[instrument(skip(self, handler))]
    pub async fn run<H, Fut>(&self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(ConnectionHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        use tokio::sync::Semaphore;

        info!("QUIC server running");

        let semaphore = if self.config.max_concurrent_handlers > 0 {
            Some(Arc::new(Semaphore::new(
                self.config.max_concurrent_handlers as usize,
            )))
        } else {
            None
        };
        let handshake_timeout = Duration::from_millis(self.config.handshake_timeout_ms);

        while let Some(incoming) = self.accept().await {
            let handler = handler.clone();
            let semaphore = semaphore.clone();

            tokio::spawn(async move {
                let _permit = if let Some(ref sem) = semaphore {
                    match sem.clone().acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            warn!("semaphore closed, dropping connection");
                            return;
                        }
                    }
                } else {
                    None
                };

                match incoming.await {
                    Ok(connection) => {
                        let remote_addr = connection.remote_address();
                        debug!(%remote_addr, "accepted connection");
                        handler(ConnectionHandler::new(connection, handshake_timeout)).await;
                    }
                    Err(e) => {
                        warn!("failed to accept connection: {}", e);
                    }
                }
            });
        }

        Ok(())
    }
}

/// Handler for an individual incoming QUIC connection
pub struct ConnectionHandler {
    connection: quinn::Connection,
    handshake_timeout: Duration,
}

impl ConnectionHandler {
    pub fn new(connection: quinn::Connection, handshake_timeout: Duration) -> Self {
        Self {
            connection,
            handshake_timeout,
        }
    }

    /// Get the remote address of the connection
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Authenticate the dialing node and open its channel.
    ///
    /// `authenticate` decides whether the announced node may join. A rejected
    /// node receives an [`AuthResult`] carrying the reason and the link is
    /// closed.
    pub async fn accept_channel<A>(
        self,
        local_node_id: &str,
        authenticate: A,
        inbound: InboundHandler,
    ) -> Result<NetworkChannel, ServerError>
    where
        A: FnOnce(&NodeAuth) -> Result<(), String>,
    {
        self.accept_channel_bound(local_node_id, authenticate, inbound, |_| Ok(()))
            .await
    }

    /// Like [`ConnectionHandler::accept_channel`], but run `bind` on the new
    /// channel before any inbound message reaches `inbound`.
    #[instrument(skip_all, fields(remote = %self.remote_address()))]
    pub async fn accept_channel_bound<A, B>(
        self,
        local_node_id: &str,
        authenticate: A,
        inbound: InboundHandler,
        bind: B,
    ) -> Result<NetworkChannel, ServerError>
    where
        A: FnOnce(&NodeAuth) -> Result<(), String>,
        B: FnOnce(&NetworkChannel) -> Result<(), String>,
    {
        let timeout_ms = self.handshake_timeout.as_millis() as u64;
        let handshake = async {
            let (send, mut recv) = self.connection.accept_bi().await?;
            let frame = read_frame(&mut recv).await?;
            if frame.message_type != MessageType::Auth {
                return Err(ServerError::UnexpectedFrame(frame.message_type));
            }
            let auth: NodeAuth = frame.decode()?;
            Ok::<_, ServerError>((send, recv, auth))
        };

        let (mut send, recv, auth) = tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| ServerError::HandshakeTimeout(timeout_ms))??;

        let verdict = if auth.protocol_version != PROTOCOL_VERSION {
            Err(format!(
                "protocol version {} is not supported (expected {})",
                auth.protocol_version, PROTOCOL_VERSION
            ))
        } else {
            authenticate(&auth)
        };

        let result = AuthResult {
            accepted: verdict.is_ok(),
            node_unique_id: local_node_id.to_string(),
            reason: verdict.as_ref().err().cloned().unwrap_or_default(),
        };
        write_frame(&mut send, &Frame::new(MessageType::AuthResult, 0, &result)?).await?;

        if let Err(reason) = verdict {
            warn!(node = %auth.node_unique_id, %reason, "rejected node link");
            let _ = send.finish();
            close_after_grace(self.connection.clone());
            return Err(ServerError::Rejected {
                node: auth.node_unique_id,
                reason,
            });
        }

        info!(node = %auth.node_unique_id, "node authenticated");
        let node = auth.node_unique_id;
        match NetworkChannel::spawn_bound(node.clone(), recv, send, inbound, bind) {
            Ok(channel) => {
                watch_channel(self.connection, channel.clone());
                Ok(channel)
            }
            Err(reason) => {
                close_after_grace(self.connection);
                Err(ServerError::Unbound { node, reason })
            }
        }
    }

    /// Check if the connection is still open
    pub fn is_open(&self) -> bool {
        self.connection.close_reason().is_none()
    }

    /// Close the connection
    pub fn close(&self, code: u32, reason: &[u8]) {
        self.connection.close(code.into(), reason);
    }
}

fn close_after_grace(connection: quinn::Connection) {
    tokio::spawn(async move {
        tokio::select! {
            _ = connection.closed() => {}
            _ = tokio::time::sleep(CLOSE_GRACE) => {
                connection.close(0u32.into(), b"link closed");
            }
        }
    });
}

/// Tie the QUIC connection lifetime to its channel.
pub(crate) fn watch_channel(connection: quinn::Connection, channel: NetworkChannel) {
    tokio::spawn(async move {
        channel.closed().await;
        close_after_grace(connection);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_all_fields() {
        let config = ClusterServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:1410".parse().unwrap());
        assert!(config.cert_pem.is_empty());
        assert!(config.key_pem.is_empty());
        assert_eq!(config.max_incoming, 1_000);
        assert_eq!(config.idle_timeout_ms, 60_000);
        assert_eq!(config.keep_alive_interval_ms, 10_000);
        assert_eq!(config.handshake_timeout_ms, 10_000);
        assert_eq!(config.udp_receive_buffer_size, 2 * 1024 * 1024);
        assert_eq!(config.udp_send_buffer_size, 2 * 1024 * 1024);
        assert_eq!(config.max_concurrent_handlers, 0);
    }

    #[tokio::test]
    async fn test_server_localhost_local_addr() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = ClusterServer::localhost(addr).unwrap();
        let local_addr = server.local_addr().unwrap();
        assert!(local_addr.port() > 0);
    }

    #[tokio::test]
    async fn test_server_accept_after_close() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = ClusterServer::localhost(addr).unwrap();
        server.close();
        assert!(server.accept().await.is_none());
    }

    #[test]
    fn test_server_with_invalid_cert() {
        let config = ClusterServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            cert_pem: b"invalid-cert".to_vec(),
            key_pem: b"invalid-key".to_vec(),
            ..Default::default()
        };
        assert!(ClusterServer::new(config).is_err());
    }

    #[test]
    fn test_build_server_config_missing_key() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let config = ClusterServerConfig {
            cert_pem: cert.cert.pem().into_bytes(),
            key_pem: Vec::new(),
            ..Default::default()
        };
        assert!(ClusterServer::build_server_config(&config).is_err());
    }

    #[test]
    fn test_build_server_config_valid() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let config = ClusterServerConfig {
            cert_pem: cert.cert.pem().into_bytes(),
            key_pem: cert.key_pair.serialize_pem().into_bytes(),
            ..Default::default()
        };
        assert!(ClusterServer::build_server_config(&config).is_ok());
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::Tls("invalid certificate".to_string());
        assert_eq!(format!("{}", err), "TLS error: invalid certificate");

        let err = ServerError::Rejected {
            node: "Node-9".to_string(),
            reason: "unknown node".to_string(),
        };
        assert_eq!(format!("{}", err), "node Node-9 rejected: unknown node");

        let err = ServerError::HandshakeTimeout(10_000);
        assert_eq!(format!("{}", err), "handshake timed out after 10000ms");

        let err = ServerError::Unbound {
            node: "Node-2".to_string(),
            reason: "unknown node".to_string(),
        };
        assert_eq!(format!("{}", err), "node Node-2 could not be bound: unknown node");
    }
}
