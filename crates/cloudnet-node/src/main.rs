// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CloudNet Node - cluster node server
//!
//! Runs one node of a cluster:
//! - QUIC links to the configured peer nodes
//! - Synchronization of tasks, groups and storages
//! - Lifecycle of the services placed on this node

use std::sync::Arc;
use tracing::{info, warn};

use cloudnet_node::config::NodeConfig;
use cloudnet_node::runner::{ProcessRunner, Runner};
use cloudnet_node::runtime::NodeRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloudnet_node=info,cloudnet_protocol=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = NodeConfig::from_env()?;

    info!(
        node_id = %config.node_id,
        listen_addr = %config.listen_addr,
        cluster_nodes = config.cluster_nodes.len(),
        data_dir = %config.data_dir.display(),
        "Starting CloudNet node"
    );

    let runner = Arc::new(ProcessRunner::new());
    info!(runner_type = runner.runner_type(), "Runner initialized");

    let runtime = NodeRuntime::builder()
        .config(config)
        .runner(runner)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "Node ready");

    // Wait for ctrl-c or a shutdown request from a peer
    let mut shutdown_requested = runtime.context().shutdown_requested();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received");
        }
        _ = shutdown_requested.wait_for(|requested| *requested) => {
            info!("Shutdown requested by cluster");
        }
    }

    runtime.shutdown().await?;

    info!("CloudNet node shut down");

    Ok(())
}
