// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node-level internal messages: membership, snapshots, sync, commands.

use std::sync::Arc;

use bytes::Bytes;
use cloudnet_protocol::{ChannelMessage, NetworkChannel};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::decode;
use crate::cluster::{
    ClusterNodeProvider, NetworkClusterNode, NetworkClusterNodeInfoSnapshot, NodeServerProvider,
};
use crate::sync::{DataSyncRegistry, SyncRequest};

pub struct NodeChannelMessageListener {
    servers: Arc<NodeServerProvider>,
    nodes: Arc<ClusterNodeProvider>,
    sync: Arc<DataSyncRegistry>,
    force_initial_sync: bool,
    shutdown: Arc<watch::Sender<bool>>,
}

impl NodeChannelMessageListener {
    pub fn new(
        servers: Arc<NodeServerProvider>,
        nodes: Arc<ClusterNodeProvider>,
        sync: Arc<DataSyncRegistry>,
        force_initial_sync: bool,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            servers,
            nodes,
            sync,
            force_initial_sync,
            shutdown,
        }
    }

    pub fn update_node_info_snapshot(&self, message: &ChannelMessage) {
        if let Some(snapshot) = decode::<NetworkClusterNodeInfoSnapshot>(message) {
            self.servers.update_node_info_snapshot(snapshot);
        }
    }

    /// Apply a sync payload. Queries are answered with the backfill.
    pub fn sync_cluster_data(&self, message: &ChannelMessage, query: bool) -> Option<Bytes> {
        let request = decode::<SyncRequest>(message)?;
        let backfill = self.sync.handle(&request.payload, request.force);
        if !query {
            return None;
        }
        let backfill = backfill?;
        match serde_json::to_vec(&backfill) {
            Ok(content) => Some(Bytes::from(content)),
            Err(e) => {
                warn!(error = %e, "Failed to encode sync backfill");
                None
            }
        }
    }

    pub fn register_known_node(&self, message: &ChannelMessage) {
        let Some(node) = decode::<NetworkClusterNode>(message) else {
            return;
        };
        let unique_id = node.unique_id.clone();
        if self.nodes.add_node_silently(node) {
            info!(node_id = %unique_id, sender = %message.sender(), "Node registered by peer");
        }
    }

    pub fn remove_known_node(&self, message: &ChannelMessage) {
        let Some(node) = decode::<NetworkClusterNode>(message) else {
            return;
        };
        if self.nodes.remove_node_silently(&node.unique_id).is_some() {
            info!(node_id = %node.unique_id, sender = %message.sender(), "Node removed by peer");
        }
    }

    pub fn cluster_node_shutdown(&self, message: &ChannelMessage) {
        info!(sender = %message.sender(), "Shutdown requested by peer");
        self.shutdown.send_replace(true);
    }

    /// Push the local data set to a connected peer that just linked up.
    pub fn request_initial_cluster_data(&self, channel: &NetworkChannel) {
        if self.servers.node_by_channel(channel).is_none() {
            debug!(peer = %channel.peer(), "Initial data requested over an unbound link");
            return;
        }

        let sync = self.sync.clone();
        let channel = channel.clone();
        let local_id = self.servers.local().unique_id().to_string();
        let force = self.force_initial_sync;
        let timeout = self.servers.query_timeout();
        tokio::spawn(async move {
            match sync.sync_with(&channel, &local_id, force, timeout).await {
                Ok(()) => debug!(peer = %channel.peer(), "Initial cluster data pushed"),
                Err(e) => warn!(peer = %channel.peer(), error = %e, "Initial cluster data push failed"),
            }
        });
    }

    pub fn send_command_line(&self, message: &ChannelMessage) -> Option<Bytes> {
        let command_line = decode::<String>(message)?;
        let output = self.servers.local().send_command_line(&command_line);
        info!(sender = %message.sender(), command = %command_line, "Executed relayed command line");
        match serde_json::to_vec(&output) {
            Ok(content) => Some(Bytes::from(content)),
            Err(e) => {
                warn!(error = %e, "Failed to encode command output");
                None
            }
        }
    }

    pub fn change_draining_state(&self, message: &ChannelMessage) {
        if let Some(draining) = decode::<bool>(message) {
            self.servers.local().drain(draining);
        }
    }
}
