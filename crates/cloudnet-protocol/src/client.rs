// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC dialer for links to other cluster nodes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Endpoint, TransportConfig};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::channel::{InboundHandler, NetworkChannel};
use crate::frame::{Frame, FrameError, MessageType, read_frame, write_frame};
use crate::proto::{AuthResult, NodeAuth, PROTOCOL_VERSION};
use crate::server::watch_channel;

/// Errors that can occur in the QUIC client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("unexpected {0:?} frame during handshake")]
    UnexpectedFrame(MessageType),

    #[error("rejected by {node}: {reason}")]
    Rejected { node: String, reason: String },

    #[error("connection timed out after {0}ms")]
    Timeout(u64),

    #[error("link to {node} could not be bound: {reason}")]
    Unbound { node: String, reason: String },
}

/// Configuration for the QUIC client
#[derive(Debug, Clone)]
pub struct ClusterClientConfig {
    /// Server name for TLS verification (use "localhost" for local dev)
    pub server_name: String,
    /// Skip certificate verification (for development only!)
    pub dangerous_skip_cert_verification: bool,
    /// Keep-alive interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Connection and handshake timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ClusterClientConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            dangerous_skip_cert_verification: false,
            keep_alive_interval_ms: 10_000,
            idle_timeout_ms: 60_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// QUIC dialer shared by all outgoing node links
pub struct ClusterClient {
    endpoint: Endpoint,
    config: ClusterClientConfig,
}

impl ClusterClient {
    /// Create a new client with the given configuration
    pub fn new(config: ClusterClientConfig) -> Result<Self, ClientError> {
        let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))?;

        let client_config = Self::build_client_config(&config)?;
        endpoint.set_default_client_config(client_config);

        Ok(Self { endpoint, config })
    }

    /// Create a client that trusts self-signed certificates, for local clusters
    pub fn localhost() -> Result<Self, ClientError> {
        Self::new(ClusterClientConfig {
            dangerous_skip_cert_verification: true,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &ClusterClientConfig {
        &self.config
    }

    fn build_client_config(config: &ClusterClientConfig) -> Result<ClientConfig, ClientError> {
        let crypto = if config.dangerous_skip_cert_verification {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        let mut transport = TransportConfig::default();
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }
        transport.max_idle_timeout(Some(
            Duration::from_millis(config.idle_timeout_ms)
                .try_into()
                .map_err(|_| ClientError::Tls("idle timeout out of range".to_string()))?,
        ));

        let mut client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| ClientError::Tls(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }

    /// Dial a node, authenticate as `local_node_id` and open the channel.
    ///
    /// The returned channel is keyed by the unique id the remote announced in
    /// its [`AuthResult`].
    pub async fn connect(
        &self,
        addr: SocketAddr,
        local_node_id: &str,
        inbound: InboundHandler,
    ) -> Result<NetworkChannel, ClientError> {
        self.connect_bound(addr, local_node_id, inbound, |_| Ok(()))
            .await
    }

    /// Like [`ClusterClient::connect`], but run `bind` on the new channel
    /// before any inbound message reaches `inbound`.
    #[instrument(skip(self, inbound, bind))]
    pub async fn connect_bound<B>(
        &self,
        addr: SocketAddr,
        local_node_id: &str,
        inbound: InboundHandler,
        bind: B,
    ) -> Result<NetworkChannel, ClientError>
    where
        B: FnOnce(&NetworkChannel) -> Result<(), String>,
    {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);

        let handshake = async {
            let connection = self.endpoint.connect(addr, &self.config.server_name)?.await?;
            let (mut send, mut recv) = connection.open_bi().await?;

            let auth = NodeAuth {
                node_unique_id: local_node_id.to_string(),
                protocol_version: PROTOCOL_VERSION,
            };
            write_frame(&mut send, &Frame::new(MessageType::Auth, 0, &auth)?).await?;

            let frame = read_frame(&mut recv).await?;
            if frame.message_type != MessageType::AuthResult {
                return Err(ClientError::UnexpectedFrame(frame.message_type));
            }
            let result: AuthResult = frame.decode()?;
            Ok::<_, ClientError>((connection, send, recv, result))
        };

        let (connection, send, recv, result) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;

        if !result.accepted {
            warn!(%addr, node = %result.node_unique_id, reason = %result.reason, "link rejected");
            connection.close(0u32.into(), b"rejected");
            return Err(ClientError::Rejected {
                node: result.node_unique_id,
                reason: result.reason,
            });
        }

        info!(%addr, node = %result.node_unique_id, "connected to node");
        let node = result.node_unique_id;
        match NetworkChannel::spawn_bound(node.clone(), recv, send, inbound, bind) {
            Ok(channel) => {
                watch_channel(connection, channel.clone());
                Ok(channel)
            }
            Err(reason) => {
                connection.close(0u32.into(), b"unbound");
                Err(ClientError::Unbound { node, reason })
            }
        }
    }

    /// Close every outgoing connection
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"client closing");
    }
}

/// Certificate verifier that skips all verification (for development only!)
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterClientConfig::default();
        assert_eq!(config.server_name, "localhost");
        assert!(!config.dangerous_skip_cert_verification);
        assert_eq!(config.keep_alive_interval_ms, 10_000);
        assert_eq!(config.idle_timeout_ms, 60_000);
        assert_eq!(config.connect_timeout_ms, 10_000);
    }

    #[tokio::test]
    async fn test_localhost_client_creation() {
        let client = ClusterClient::localhost();
        assert!(client.is_ok(), "failed to create client: {:?}", client.err());
        assert!(client.unwrap().config().dangerous_skip_cert_verification);
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Timeout(5000);
        assert_eq!(format!("{}", err), "connection timed out after 5000ms");

        let err = ClientError::Rejected {
            node: "Node-1".to_string(),
            reason: "unknown node".to_string(),
        };
        assert_eq!(format!("{}", err), "rejected by Node-1: unknown node");

        let err = ClientError::UnexpectedFrame(MessageType::Query);
        assert_eq!(
            format!("{}", err),
            "unexpected Query frame during handshake"
        );
    }
}
