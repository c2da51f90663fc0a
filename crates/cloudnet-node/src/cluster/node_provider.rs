// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster membership changes and their propagation.

use std::collections::BTreeMap;
use std::sync::Arc;

use cloudnet_protocol::{ChannelMessage, InternalMessage};
use tracing::{info, warn};

use super::{NetworkClusterNode, NetworkClusterNodeInfoSnapshot, NodeServerProvider};
use crate::error::Result;
use crate::events::{CloudEvent, EventManager};

/// Membership of the cluster as seen by this node.
///
/// `add_node` / `remove_node` tell every connected peer; the `_silently`
/// variants apply a change received from a peer without echoing it.
pub struct ClusterNodeProvider {
    servers: Arc<NodeServerProvider>,
    events: Arc<EventManager>,
}

impl ClusterNodeProvider {
    pub fn new(servers: Arc<NodeServerProvider>, events: Arc<EventManager>) -> Self {
        Self { servers, events }
    }

    pub fn servers(&self) -> &Arc<NodeServerProvider> {
        &self.servers
    }

    /// Known peers, sorted by id. The local node is not included.
    pub fn nodes(&self) -> Vec<NetworkClusterNode> {
        self.servers
            .nodes()
            .iter()
            .map(|remote| remote.node().clone())
            .collect()
    }

    pub fn node(&self, unique_id: &str) -> Option<NetworkClusterNode> {
        self.servers
            .node(unique_id)
            .map(|remote| remote.node().clone())
    }

    pub fn add_node(&self, node: NetworkClusterNode) -> bool {
        if !self.add_node_silently(node.clone()) {
            return false;
        }
        self.broadcast(InternalMessage::RegisterKnownNode, &node);
        true
    }

    /// Track a peer. `false` for the local node or an already known one.
    pub fn add_node_silently(&self, node: NetworkClusterNode) -> bool {
        if node.unique_id == self.servers.local().unique_id()
            || self.servers.node(&node.unique_id).is_some()
        {
            return false;
        }
        self.servers.register_node(node.clone());
        info!(node_id = %node.unique_id, "Registered cluster node");
        self.events.publish(&CloudEvent::ClusterNodeAdded { node });
        true
    }

    pub fn remove_node(&self, unique_id: &str) -> Option<NetworkClusterNode> {
        let node = self.remove_node_silently(unique_id)?;
        self.broadcast(InternalMessage::RemoveKnownNode, &node);
        Some(node)
    }

    pub fn remove_node_silently(&self, unique_id: &str) -> Option<NetworkClusterNode> {
        let node = self.servers.unregister_node(unique_id)?.node().clone();
        info!(node_id = %node.unique_id, "Removed cluster node");
        self.events.publish(&CloudEvent::ClusterNodeRemoved { node: node.clone() });
        Some(node)
    }

    /// Last snapshot of every peer that published one.
    pub fn node_info_snapshots(&self) -> BTreeMap<String, NetworkClusterNodeInfoSnapshot> {
        self.servers
            .nodes()
            .iter()
            .filter_map(|remote| {
                remote
                    .node_info_snapshot()
                    .map(|snapshot| (remote.unique_id().to_string(), snapshot))
            })
            .collect()
    }

    pub fn node_info_snapshot(&self, unique_id: &str) -> Option<NetworkClusterNodeInfoSnapshot> {
        self.servers.node(unique_id)?.node_info_snapshot()
    }

    /// Run a command line on this node.
    pub fn send_command_line(&self, command_line: &str) -> Vec<String> {
        self.servers.local().send_command_line(command_line)
    }

    /// Run a command line on `unique_id`, which may be this node.
    pub async fn send_command_line_to_node(
        &self,
        unique_id: &str,
        command_line: &str,
    ) -> Result<Vec<String>> {
        let output = self
            .servers
            .send_command_line_to_node(unique_id, command_line)
            .await?;
        info!(node_id = %unique_id, command = %command_line, "Command line relayed");
        Ok(output)
    }

    fn broadcast(&self, kind: InternalMessage, node: &NetworkClusterNode) {
        match serde_json::to_vec(node) {
            Ok(content) => {
                self.servers
                    .broadcast(&ChannelMessage::internal(kind, content));
            }
            Err(e) => warn!(node_id = %node.unique_id, error = %e, "Failed to encode node"),
        }
    }
}

impl std::fmt::Debug for ClusterNodeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNodeProvider")
            .field("servers", &self.servers)
            .finish()
    }
}
