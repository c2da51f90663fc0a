// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for cloudnet-node.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::cluster::NetworkClusterNode;

/// Node configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique id of this node within the cluster
    pub node_id: String,
    /// QUIC listen address for node links
    pub listen_addr: SocketAddr,
    /// Statically configured peer nodes
    pub cluster_nodes: Vec<NetworkClusterNode>,
    /// Data directory for local templates and service working directories
    pub data_dir: PathBuf,
    /// Whether data pushed to a joining peer overwrites its local state
    pub force_initial_cluster_data_sync: bool,
    /// Deadline for queries to other nodes
    pub query_timeout: Duration,
    /// Interval between node and service snapshot publications
    pub snapshot_interval: Duration,
    /// Interval between attempts to dial disconnected peers
    pub reconnect_interval: Duration,
    /// Memory advertised to the cluster, in megabytes
    pub max_memory_mb: u32,
}

impl NodeConfig {
    /// Configuration with defaults for everything but the node id.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 1410)),
            cluster_nodes: Vec::new(),
            data_dir: PathBuf::from(".data"),
            force_initial_cluster_data_sync: false,
            query_timeout: Duration::from_secs(30),
            snapshot_interval: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(5),
            max_memory_mb: 2048,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_id = std::env::var("CLOUDNET_NODE_ID")
            .map_err(|_| ConfigError::MissingEnvVar("CLOUDNET_NODE_ID"))?;
        if node_id.trim().is_empty() {
            return Err(ConfigError::MissingEnvVar("CLOUDNET_NODE_ID"));
        }

        let defaults = Self::new(node_id.trim());

        let listen_addr = match std::env::var("CLOUDNET_LISTEN_ADDR") {
            Ok(value) => value
                .parse()
                .map_err(|_| ConfigError::InvalidAddress(value))?,
            Err(_) => defaults.listen_addr,
        };

        let cluster_nodes = std::env::var("CLOUDNET_CLUSTER_NODES")
            .map(|value| parse_cluster_nodes(&value))
            .unwrap_or_else(|_| Ok(Vec::new()))?;

        let data_dir = std::env::var("CLOUDNET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let force_initial_cluster_data_sync = std::env::var("CLOUDNET_FORCE_INITIAL_SYNC")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let query_timeout = env_millis("CLOUDNET_QUERY_TIMEOUT_MS", defaults.query_timeout)?;
        let snapshot_interval =
            env_millis("CLOUDNET_SNAPSHOT_INTERVAL_MS", defaults.snapshot_interval)?;
        let reconnect_interval =
            env_millis("CLOUDNET_RECONNECT_INTERVAL_MS", defaults.reconnect_interval)?;

        let max_memory_mb = match std::env::var("CLOUDNET_MAX_MEMORY_MB") {
            Ok(value) => value.parse().map_err(|_| ConfigError::InvalidNumber {
                var: "CLOUDNET_MAX_MEMORY_MB",
                value,
            })?,
            Err(_) => defaults.max_memory_mb,
        };

        Ok(Self {
            node_id: defaults.node_id,
            listen_addr,
            cluster_nodes,
            data_dir,
            force_initial_cluster_data_sync,
            query_timeout,
            snapshot_interval,
            reconnect_interval,
            max_memory_mb,
        })
    }

    /// Root of the local template storage.
    pub fn local_templates_dir(&self) -> PathBuf {
        self.data_dir.join("local").join("templates")
    }

    /// Root of the working directories of dynamic services.
    pub fn temp_services_dir(&self) -> PathBuf {
        self.data_dir.join("temp").join("services")
    }

    /// Root of the working directories of static services.
    pub fn static_services_dir(&self) -> PathBuf {
        self.data_dir.join("local").join("services")
    }
}

fn env_millis(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        Err(_) => Ok(default),
    }
}

/// Parse a comma separated `id@host:port` peer list.
pub fn parse_cluster_nodes(value: &str) -> Result<Vec<NetworkClusterNode>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, addr) = entry
                .split_once('@')
                .ok_or_else(|| ConfigError::InvalidPeer(entry.to_string()))?;
            if id.is_empty() {
                return Err(ConfigError::InvalidPeer(entry.to_string()));
            }
            let addr: SocketAddr = addr
                .parse()
                .map_err(|_| ConfigError::InvalidPeer(entry.to_string()))?;
            Ok(NetworkClusterNode::new(id, vec![addr]))
        })
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The listen address is not a socket address.
    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),
    /// A numeric variable could not be parsed.
    #[error("Invalid value for {var}: {value}")]
    InvalidNumber { var: &'static str, value: String },
    /// A cluster peer entry is not of the form `id@host:port`.
    #[error("Invalid cluster node entry: {0}")]
    InvalidPeer(String),
}
