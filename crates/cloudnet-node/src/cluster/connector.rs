// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker keeping links to configured peers.
//!
//! Only the node with the lower unique id dials, so two nodes never hold two
//! links to each other. The other side waits for the incoming connection.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cloudnet_protocol::{
    ChannelMessage, ClientError, ClusterClient, InboundHandler, InternalMessage, NetworkChannel,
};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{NodeServerProvider, RemoteNodeServer};

/// Configuration for the peer connector.
#[derive(Debug, Clone)]
pub struct PeerConnectorConfig {
    /// Delay between connection rounds.
    pub reconnect_interval: Duration,
}

impl Default for PeerConnectorConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
        }
    }
}

/// Dials configured peers and re-dials them after a disconnect.
pub struct PeerConnector {
    client: ClusterClient,
    servers: Arc<NodeServerProvider>,
    inbound: InboundHandler,
    config: PeerConnectorConfig,
    shutdown: Arc<Notify>,
}

/// Whether this node is responsible for dialing `peer`.
pub fn dials(local_id: &str, peer_id: &str) -> bool {
    local_id < peer_id
}

/// Ask a freshly linked peer to push its cluster data to us.
pub fn request_initial_cluster_data(channel: &NetworkChannel, local_id: &str) {
    let message = ChannelMessage::internal(InternalMessage::RequestInitialClusterData, Bytes::new())
        .with_sender(local_id);
    if let Err(e) = channel.send_message(&message) {
        warn!(peer = %channel.peer(), error = %e, "Failed to request initial cluster data");
    }
}

impl PeerConnector {
    pub fn new(
        client: ClusterClient,
        servers: Arc<NodeServerProvider>,
        inbound: InboundHandler,
        config: PeerConnectorConfig,
    ) -> Self {
        Self {
            client,
            servers,
            inbound,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run connection rounds until shutdown. The first round starts at once.
    pub async fn run(&self) {
        info!(
            reconnect_interval_ms = self.config.reconnect_interval.as_millis() as u64,
            "Peer connector started"
        );

        self.connect_missing().await;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Peer connector received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.reconnect_interval) => {
                    self.connect_missing().await;
                }
            }
        }

        self.client.close();
        info!("Peer connector stopped");
    }

    /// Dial every peer we are responsible for that has no live link.
    pub async fn connect_missing(&self) {
        let local_id = self.servers.local().unique_id().to_string();
        for remote in self.servers.nodes() {
            if remote.is_available() || !dials(&local_id, remote.unique_id()) {
                continue;
            }
            self.connect(&local_id, &remote).await;
        }
    }

    async fn connect(&self, local_id: &str, remote: &RemoteNodeServer) {
        for addr in &remote.node().listeners {
            let bind = |channel: &NetworkChannel| {
                if channel.peer() != remote.unique_id() {
                    return Err(format!(
                        "expected {} but peer announced {}",
                        remote.unique_id(),
                        channel.peer()
                    ));
                }
                self.servers
                    .attach_channel(channel.clone())
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            };
            match self
                .client
                .connect_bound(*addr, local_id, self.inbound.clone(), bind)
                .await
            {
                Ok(channel) => {
                    request_initial_cluster_data(&channel, local_id);
                    return;
                }
                Err(e @ ClientError::Unbound { .. }) => {
                    warn!(node_id = %remote.unique_id(), %addr, error = %e, "Failed to bind link");
                }
                Err(e) => {
                    debug!(node_id = %remote.unique_id(), %addr, error = %e, "Peer not reachable");
                }
            }
        }
    }
}
