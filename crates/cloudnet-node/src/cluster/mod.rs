// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster membership: configured nodes, their live links and snapshots.

pub mod connector;
pub mod node_provider;
pub mod server_provider;

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use connector::{PeerConnector, PeerConnectorConfig};
pub use node_provider::ClusterNodeProvider;
pub use server_provider::{CommandExecutor, LocalNodeServer, NodeServerProvider, RemoteNodeServer};

/// Static membership entry of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkClusterNode {
    pub unique_id: String,
    pub listeners: Vec<SocketAddr>,
}

impl NetworkClusterNode {
    pub fn new(unique_id: impl Into<String>, listeners: Vec<SocketAddr>) -> Self {
        Self {
            unique_id: unique_id.into(),
            listeners,
        }
    }
}

/// Point-in-time status of a node, published periodically to its peers.
///
/// Snapshots of one node are ordered by `(startup_millis, sequence)`: the
/// sequence restarts with the process while the startup time grows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkClusterNodeInfoSnapshot {
    pub node: NetworkClusterNode,
    pub creation_time: DateTime<Utc>,
    pub startup_millis: i64,
    pub sequence: u64,
    pub max_memory_mb: u32,
    pub current_services: u32,
    pub draining: bool,
    pub version: String,
}

impl NetworkClusterNodeInfoSnapshot {
    pub fn recency(&self) -> (i64, u64) {
        (self.startup_millis, self.sequence)
    }

    pub fn is_newer_than(&self, other: &NetworkClusterNodeInfoSnapshot) -> bool {
        self.recency() > other.recency()
    }
}
