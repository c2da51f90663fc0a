// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CloudNet Node - Cluster Membership and Service Lifecycle
//!
//! A node hosts game server and proxy processes ("services"), keeps shared
//! configuration in sync with the other nodes of its cluster and tells its
//! peers what it runs.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                        Peer nodes (QUIC links)                        │
//! └───────────────────────────────────────────────────────────────────────┘
//!                                   │ ChannelMessage
//!                                   ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                     cloudnet-node (This Crate)                        │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐   │
//! │  │  Listeners  │─▶│   Cluster   │  │  DataSync   │  │   Service   │   │
//! │  │ (dispatch)  │  │ Membership  │  │  Registry   │  │   Manager   │   │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘   │
//! └───────────────────────────────────────────────────────────────────────┘
//!                                                  │              │
//!                                        templates │              │ spawn
//!                                                  ▼              ▼
//!                                   ┌──────────────────┐  ┌──────────────┐
//!                                   │ Template storage │  │  Processes   │
//!                                   └──────────────────┘  └──────────────┘
//! ```
//!
//! # Service Lifecycle
//!
//! | From | Allowed targets |
//! |------|-----------------|
//! | `PREPARED` | `RUNNING`, `STOPPED`, `DELETED` |
//! | `RUNNING` | `STOPPED`, `DELETED` |
//! | `STOPPED` | `PREPARED`, `DELETED` |
//! | `DELETED` | - |
//!
//! # Internal Messages
//!
//! | Message | Effect on the receiver |
//! |---------|------------------------|
//! | `update_node_info_snapshot` | Replace the sender's snapshot if newer |
//! | `sync_cluster_data` | Apply the payload, answer queries with the backfill |
//! | `register_known_node` | Add a node without re-broadcasting |
//! | `remove_known_node` | Remove a node without re-broadcasting |
//! | `cluster_node_shutdown` | Request orderly shutdown |
//! | `request_initial_cluster_data` | Push local data to the requesting peer |
//! | `send_command_line` | Run a command line, answer with its output |
//! | `change_draining_state` | Toggle acceptance of new services |
//! | `set_service_tasks` / `add_service_task` / `remove_service_task` | Apply task changes |
//! | `update_service_info` | Record a peer's service snapshot |
//!
//! Unknown names are ignored.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CLOUDNET_NODE_ID` | Yes | - | Unique id of this node |
//! | `CLOUDNET_LISTEN_ADDR` | No | `0.0.0.0:1410` | QUIC listen address |
//! | `CLOUDNET_CLUSTER_NODES` | No | - | Peers as `id@host:port`, comma separated |
//! | `CLOUDNET_DATA_DIR` | No | `.data` | Templates and working directories |
//! | `CLOUDNET_FORCE_INITIAL_SYNC` | No | `false` | Overwrite joining peers' data |
//! | `CLOUDNET_QUERY_TIMEOUT_MS` | No | `30000` | Deadline for node queries |
//! | `CLOUDNET_SNAPSHOT_INTERVAL_MS` | No | `5000` | Snapshot publication period |
//! | `CLOUDNET_RECONNECT_INTERVAL_MS` | No | `5000` | Peer re-dial period |
//! | `CLOUDNET_MAX_MEMORY_MB` | No | `2048` | Memory advertised to peers |

/// Node configuration loaded from environment variables.
pub mod config;

/// Error types for node operations.
pub mod error;

/// Typed in-process events.
pub mod events;

/// Service lifecycle states and legal transitions.
pub mod lifecycle;

/// Cluster membership, node links and snapshots.
pub mod cluster;

/// Reconciliation of shared configuration between nodes.
pub mod sync;

/// Service tasks, groups and storage declarations.
pub mod task;

/// Template storage backends.
pub mod template;

/// Process execution backends.
pub mod runner;

/// Services and their lifecycle manager.
pub mod service;

/// Inbound channel message handling.
pub mod listener;

/// Wiring of a node's components.
pub mod node;

/// Background worker publishing snapshots.
pub mod snapshot_publisher;

/// Embeddable runtime.
pub mod runtime;

pub use error::{Error, Result};
pub use lifecycle::ServiceLifeCycle;
pub use node::NodeContext;
pub use runtime::NodeRuntime;
