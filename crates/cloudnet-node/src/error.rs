// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cloudnet-node.

use thiserror::Error;

/// Node errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Process control failed.
    #[error("Runner error: {0}")]
    Runner(#[from] crate::runner::RunnerError),

    /// Template storage operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] crate::template::StorageError),

    /// A lifecycle operation was rejected.
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] crate::lifecycle::LifecycleError),

    /// Cluster data reconciliation failed.
    #[error("Sync error: {0}")]
    Sync(#[from] crate::sync::SyncError),

    /// Communication with another node failed.
    #[error("Channel error: {0}")]
    Channel(#[from] cloudnet_protocol::ChannelError),

    /// Service was not found.
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Node is not part of the cluster.
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// Node is known but not connected.
    #[error("Node not connected: {0}")]
    NodeUnavailable(String),

    /// The local node is draining and accepts no new services.
    #[error("Node {0} is draining and does not accept new services")]
    Draining(String),

    /// The service may not be placed on this node.
    #[error("Service {service} is not allowed on node {node}")]
    NodeNotAllowed {
        /// Display name of the service.
        service: String,
        /// Node that was asked to host it.
        node: String,
    },

    /// A configuration value is missing or invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result type using the node Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{LifecycleError, ServiceLifeCycle};

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::ServiceNotFound("Lobby-1".to_string()).to_string(),
            "Service not found: Lobby-1"
        );
        assert_eq!(
            Error::Draining("Node-1".to_string()).to_string(),
            "Node Node-1 is draining and does not accept new services"
        );
        assert_eq!(
            Error::NodeNotAllowed {
                service: "Lobby-1".to_string(),
                node: "Node-2".to_string()
            }
            .to_string(),
            "Service Lobby-1 is not allowed on node Node-2"
        );
    }

    #[test]
    fn test_lifecycle_error_conversion() {
        let err: Error = LifecycleError::IllegalTransition {
            from: ServiceLifeCycle::Deleted,
            to: ServiceLifeCycle::Running,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Lifecycle error: illegal lifecycle transition DELETED -> RUNNING"
        );
    }
}
