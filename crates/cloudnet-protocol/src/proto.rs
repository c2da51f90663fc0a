// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf wire messages carried inside frames.

use prost::Message;

/// Protocol version announced during authentication.
pub const PROTOCOL_VERSION: u32 = 1;

/// A channel message as it travels on the wire.
#[derive(Clone, PartialEq, Message)]
pub struct ChannelMessage {
    /// Channel namespace (e.g. `cloudnet_internal`).
    #[prost(string, tag = "1")]
    pub channel: String,
    /// Message name, the dispatch key within the channel.
    #[prost(string, tag = "2")]
    pub message: String,
    /// Opaque content buffer.
    #[prost(bytes = "vec", tag = "3")]
    pub content: Vec<u8>,
    /// Unique id of the sending node.
    #[prost(string, tag = "4")]
    pub sender: String,
}

/// Response to a query. `content` is absent when no listener answered.
#[derive(Clone, PartialEq, Message)]
pub struct QueryResponse {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub content: Option<Vec<u8>>,
}

/// First frame sent by a dialing node.
#[derive(Clone, PartialEq, Message)]
pub struct NodeAuth {
    #[prost(string, tag = "1")]
    pub node_unique_id: String,
    #[prost(uint32, tag = "2")]
    pub protocol_version: u32,
}

/// Answer of the accepting node to [`NodeAuth`].
#[derive(Clone, PartialEq, Message)]
pub struct AuthResult {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    #[prost(string, tag = "2")]
    pub node_unique_id: String,
    #[prost(string, tag = "3")]
    pub reason: String,
}
