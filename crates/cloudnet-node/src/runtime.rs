// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for cloudnet-node.
//!
//! [`NodeRuntime`] runs a node inside an existing tokio application instead
//! of the standalone binary.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cloudnet_node::config::NodeConfig;
//! use cloudnet_node::runner::ProcessRunner;
//! use cloudnet_node::runtime::NodeRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = NodeRuntime::builder()
//!         .config(NodeConfig::from_env()?)
//!         .runner(Arc::new(ProcessRunner::new()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! Start-up follows the component order of [`NodeContext`]: the QUIC
//! endpoint is bound, membership and services are wired, then the peer
//! connector dials configured nodes and the snapshot publisher starts.
//! Shutdown runs in reverse.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use cloudnet_protocol::proto::NodeAuth;
use cloudnet_protocol::{
    ClusterClient, ClusterClientConfig, ClusterServer, ClusterServerConfig, ConnectionHandler,
    NetworkChannel,
};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cluster::{CommandExecutor, PeerConnector, PeerConnectorConfig};
use crate::config::NodeConfig;
use crate::node::NodeContext;
use crate::runner::Runner;
use crate::snapshot_publisher::{SnapshotPublisher, SnapshotPublisherConfig};
use crate::template::{FileInclusionFetcher, InclusionFetcher};

/// Builder for creating a [`NodeRuntime`].
pub struct NodeRuntimeBuilder {
    config: Option<NodeConfig>,
    runner: Option<Arc<dyn Runner>>,
    command_executor: Option<Arc<dyn CommandExecutor>>,
    inclusion_fetcher: Option<Arc<dyn InclusionFetcher>>,
    server_config: Option<ClusterServerConfig>,
    client_config: Option<ClusterClientConfig>,
}

impl Default for NodeRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: None,
            runner: None,
            command_executor: None,
            inclusion_fetcher: None,
            server_config: None,
            client_config: None,
        }
    }

    /// Set the node configuration (required).
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the process runner (required).
    pub fn runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Set the executor for relayed command lines.
    ///
    /// Without one, every command line yields no output.
    pub fn command_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.command_executor = Some(executor);
        self
    }

    /// Set the fetcher for remote inclusions. Defaults to local files only.
    pub fn inclusion_fetcher(mut self, fetcher: Arc<dyn InclusionFetcher>) -> Self {
        self.inclusion_fetcher = Some(fetcher);
        self
    }

    /// Set the QUIC server configuration.
    ///
    /// Without a certificate, a self-signed one is generated.
    pub fn server_config(mut self, config: ClusterServerConfig) -> Self {
        self.server_config = Some(config);
        self
    }

    /// Set the QUIC client configuration used to dial peers.
    ///
    /// Defaults to a client trusting self-signed certificates.
    pub fn client_config(mut self, config: ClusterClientConfig) -> Self {
        self.client_config = Some(config);
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<NodeRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        let runner = self
            .runner
            .ok_or_else(|| anyhow::anyhow!("runner is required"))?;

        Ok(NodeRuntimeConfig {
            config,
            runner,
            command_executor: self
                .command_executor
                .unwrap_or_else(|| Arc::new(|_: &str| Vec::<String>::new())),
            inclusion_fetcher: self
                .inclusion_fetcher
                .unwrap_or_else(|| Arc::new(FileInclusionFetcher)),
            server_config: self
                .server_config
                .unwrap_or_else(ClusterServerConfig::from_env),
            client_config: self.client_config,
        })
    }
}

/// Validated configuration, ready to start.
pub struct NodeRuntimeConfig {
    config: NodeConfig,
    runner: Arc<dyn Runner>,
    command_executor: Arc<dyn CommandExecutor>,
    inclusion_fetcher: Arc<dyn InclusionFetcher>,
    server_config: ClusterServerConfig,
    client_config: Option<ClusterClientConfig>,
}

impl NodeRuntimeConfig {
    /// Bind the endpoint, wire the node and start the background tasks.
    pub async fn start(self) -> Result<NodeRuntime> {
        let listen_addr = self.config.listen_addr;
        let server = if self.server_config.cert_pem.is_empty() {
            ClusterServer::localhost_with_config(listen_addr, self.server_config)?
        } else {
            ClusterServer::new(ClusterServerConfig {
                bind_addr: listen_addr,
                ..self.server_config
            })?
        };
        let server = Arc::new(server);
        let local_addr = server.local_addr()?;

        let client = match self.client_config {
            Some(config) => ClusterClient::new(config)?,
            None => ClusterClient::localhost()?,
        };

        let connector_config = PeerConnectorConfig {
            reconnect_interval: self.config.reconnect_interval,
        };
        let publisher_config = SnapshotPublisherConfig {
            interval: self.config.snapshot_interval,
        };

        // advertise the bound port when 0 was requested
        let mut config = self.config;
        config.listen_addr = local_addr;
        let context = Arc::new(NodeContext::new(
            config,
            self.runner,
            self.command_executor,
            self.inclusion_fetcher,
        )?);

        // QUIC server task
        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(run_cluster_server_with_shutdown(
            server,
            context.clone(),
            server_shutdown_rx,
        ));

        // Peer connector
        let connector = PeerConnector::new(
            client,
            context.servers().clone(),
            context.inbound_handler(),
            connector_config,
        );
        let connector_shutdown = connector.shutdown_handle();
        let connector_handle = tokio::spawn(async move {
            connector.run().await;
        });

        // Snapshot publisher
        let publisher = SnapshotPublisher::new(
            context.servers().clone(),
            context.services().clone(),
            publisher_config,
        );
        let publisher_shutdown = publisher.shutdown_handle();
        let publisher_handle = tokio::spawn(async move {
            publisher.run().await;
        });

        info!(
            node_id = %context.unique_id(),
            listen_addr = %local_addr,
            cluster_nodes = context.nodes().nodes().len(),
            "NodeRuntime started"
        );

        Ok(NodeRuntime {
            server_handle,
            connector_handle,
            publisher_handle,
            server_shutdown_tx,
            connector_shutdown,
            publisher_shutdown,
            context,
            local_addr,
        })
    }
}

/// A running node that can be embedded in an application.
///
/// The runtime manages:
/// - QUIC server accepting links from known nodes
/// - Peer connector dialing configured nodes
/// - Snapshot publisher announcing node and service state
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct NodeRuntime {
    server_handle: JoinHandle<Result<()>>,
    connector_handle: JoinHandle<()>,
    publisher_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    connector_shutdown: Arc<Notify>,
    publisher_shutdown: Arc<Notify>,
    context: Arc<NodeContext>,
    local_addr: SocketAddr,
}

impl NodeRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> NodeRuntimeBuilder {
        NodeRuntimeBuilder::new()
    }

    /// Address the QUIC server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    /// Gracefully shut down the node.
    ///
    /// Stops the background workers, deletes every local service, closes
    /// all peer links (pending queries fail as cancelled) and finally the
    /// QUIC endpoint.
    pub async fn shutdown(self) -> Result<()> {
        info!(node_id = %self.context.unique_id(), "NodeRuntime shutting down...");

        self.publisher_shutdown.notify_one();
        self.connector_shutdown.notify_one();

        if let Err(e) = self.publisher_handle.await {
            error!("Snapshot publisher task panicked: {}", e);
        }
        if let Err(e) = self.connector_handle.await {
            error!("Peer connector task panicked: {}", e);
        }

        let deleted = self.context.services().delete_all().await;
        debug!(deleted, "Local services deleted");

        self.context.servers().close_all();

        let _ = self.server_shutdown_tx.send(true);
        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("NodeRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("NodeRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("NodeRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
            && !self.connector_handle.is_finished()
            && !self.publisher_handle.is_finished()
    }
}

/// Run the accept loop until the shutdown signal fires.
async fn run_cluster_server_with_shutdown(
    server: Arc<ClusterServer>,
    context: Arc<NodeContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    info!(node_id = %context.unique_id(), "Cluster QUIC server starting");

    let accepting = server.clone();
    let accept_loop = accepting.run(move |conn: ConnectionHandler| {
        let context = context.clone();
        async move {
            handle_connection(conn, context).await;
        }
    });

    tokio::select! {
        result = accept_loop => result?,
        _ = shutdown_rx.changed() => {
            info!("Cluster QUIC server received shutdown signal");
            server.close();
        }
    }

    info!("Cluster QUIC server stopped");
    Ok(())
}

/// Authenticate a dialing node and bind its channel.
async fn handle_connection(conn: ConnectionHandler, context: Arc<NodeContext>) {
    let remote = conn.remote_address();
    let servers = context.servers().clone();
    let authenticate = |auth: &NodeAuth| {
        if servers.node(&auth.node_unique_id).is_some() {
            Ok(())
        } else {
            Err(format!("node {} is not part of the cluster", auth.node_unique_id))
        }
    };

    let bind = |channel: &NetworkChannel| {
        context
            .attach_channel(channel.clone())
            .map(|_| ())
            .map_err(|e| e.to_string())
    };

    if let Err(e) = conn
        .accept_channel_bound(context.unique_id(), authenticate, context.inbound_handler(), bind)
        .await
    {
        warn!(%remote, error = %e, "Node link rejected");
    }
}
