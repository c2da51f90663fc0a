// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Channel messages and the closed set of internal message names.

use std::fmt;

use bytes::Bytes;

use crate::proto;

/// Reserved channel used for node-to-node coordination.
pub const INTERNAL_CHANNEL: &str = "cloudnet_internal";

/// An addressed, named payload exchanged between nodes.
///
/// Immutable once built; use [`ChannelMessage::with_sender`] to stamp the
/// originating node before sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    channel: String,
    message: String,
    content: Bytes,
    sender: String,
}

impl ChannelMessage {
    /// Create a message on an arbitrary channel.
    pub fn new(
        channel: impl Into<String>,
        message: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        Self {
            channel: channel.into(),
            message: message.into(),
            content: content.into(),
            sender: String::new(),
        }
    }

    /// Create a message on the internal channel.
    pub fn internal(kind: InternalMessage, content: impl Into<Bytes>) -> Self {
        Self::new(INTERNAL_CHANNEL, kind.name(), content)
    }

    /// Return a copy of this message stamped with the sending node id.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Whether this message travels on [`INTERNAL_CHANNEL`].
    pub fn is_internal(&self) -> bool {
        self.channel == INTERNAL_CHANNEL
    }

    /// The internal message kind, or `None` for messages on other channels.
    pub fn internal_kind(&self) -> Option<InternalMessage> {
        self.is_internal()
            .then(|| InternalMessage::from_name(&self.message))
    }

    pub fn to_proto(&self) -> proto::ChannelMessage {
        proto::ChannelMessage {
            channel: self.channel.clone(),
            message: self.message.clone(),
            content: self.content.to_vec(),
            sender: self.sender.clone(),
        }
    }
}

impl From<proto::ChannelMessage> for ChannelMessage {
    fn from(value: proto::ChannelMessage) -> Self {
        Self {
            channel: value.channel,
            message: value.message,
            content: Bytes::from(value.content),
            sender: value.sender,
        }
    }
}

/// Known message names on the internal channel.
///
/// Names a peer sends that this build does not know end up in
/// [`InternalMessage::Unrecognized`] and are ignored by every listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InternalMessage {
    UpdateNodeInfoSnapshot,
    SyncClusterData,
    RegisterKnownNode,
    RemoveKnownNode,
    ClusterNodeShutdown,
    RequestInitialClusterData,
    SendCommandLine,
    ChangeDrainingState,
    SetServiceTasks,
    AddServiceTask,
    RemoveServiceTask,
    UpdateServiceInfo,
    Unrecognized(String),
}

impl InternalMessage {
    /// Every known kind, in wire-name order of introduction.
    pub const KNOWN: [InternalMessage; 12] = [
        InternalMessage::UpdateNodeInfoSnapshot,
        InternalMessage::SyncClusterData,
        InternalMessage::RegisterKnownNode,
        InternalMessage::RemoveKnownNode,
        InternalMessage::ClusterNodeShutdown,
        InternalMessage::RequestInitialClusterData,
        InternalMessage::SendCommandLine,
        InternalMessage::ChangeDrainingState,
        InternalMessage::SetServiceTasks,
        InternalMessage::AddServiceTask,
        InternalMessage::RemoveServiceTask,
        InternalMessage::UpdateServiceInfo,
    ];

    /// Resolve a wire name. Exact, case-sensitive match.
    pub fn from_name(name: &str) -> Self {
        match name {
            "update_node_info_snapshot" => Self::UpdateNodeInfoSnapshot,
            "sync_cluster_data" => Self::SyncClusterData,
            "register_known_node" => Self::RegisterKnownNode,
            "remove_known_node" => Self::RemoveKnownNode,
            "cluster_node_shutdown" => Self::ClusterNodeShutdown,
            "request_initial_cluster_data" => Self::RequestInitialClusterData,
            "send_command_line" => Self::SendCommandLine,
            "change_draining_state" => Self::ChangeDrainingState,
            "set_service_tasks" => Self::SetServiceTasks,
            "add_service_task" => Self::AddServiceTask,
            "remove_service_task" => Self::RemoveServiceTask,
            "update_service_info" => Self::UpdateServiceInfo,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    /// The wire name of this kind.
    pub fn name(&self) -> &str {
        match self {
            Self::UpdateNodeInfoSnapshot => "update_node_info_snapshot",
            Self::SyncClusterData => "sync_cluster_data",
            Self::RegisterKnownNode => "register_known_node",
            Self::RemoveKnownNode => "remove_known_node",
            Self::ClusterNodeShutdown => "cluster_node_shutdown",
            Self::RequestInitialClusterData => "request_initial_cluster_data",
            Self::SendCommandLine => "send_command_line",
            Self::ChangeDrainingState => "change_draining_state",
            Self::SetServiceTasks => "set_service_tasks",
            Self::AddServiceTask => "add_service_task",
            Self::RemoveServiceTask => "remove_service_task",
            Self::UpdateServiceInfo => "update_service_info",
            Self::Unrecognized(name) => name,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }
}

impl fmt::Display for InternalMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
