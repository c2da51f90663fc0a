// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CloudNet Protocol - node-to-node communication layer
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    cloudnet-protocol                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Channel: messages, queries, ordered inbound dispatch       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: [len][type][query id][protobuf payload]           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn), one stream per node link          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A link starts with the dialing node sending [`proto::NodeAuth`]; the
//! accepting node answers with [`proto::AuthResult`]. Afterwards both sides
//! exchange [`ChannelMessage`]s as plain messages or as queries awaiting a
//! correlated response.
//!
//! # Usage
//!
//! ```ignore
//! use cloudnet_protocol::{ChannelMessage, ClusterClient, inbound_handler};
//!
//! let client = ClusterClient::localhost()?;
//! let channel = client
//!     .connect(addr, "Node-1", inbound_handler(|_, _| async { None }))
//!     .await?;
//!
//! let reply = channel
//!     .send_query(&ChannelMessage::new("bridge", "ping", vec![]), timeout)
//!     .await?;
//! ```

pub mod channel;
pub mod client;
pub mod frame;
pub mod message;
pub mod proto;
pub mod server;

pub use channel::{
    ChannelError, InboundFuture, InboundHandler, InboundMessage, NetworkChannel, inbound_handler,
};
pub use client::{ClientError, ClusterClient, ClusterClientConfig};
pub use frame::{Frame, FrameError, MessageType};
pub use message::{ChannelMessage, INTERNAL_CHANNEL, InternalMessage};
pub use server::{ClusterServer, ClusterServerConfig, ConnectionHandler, ServerError};
