// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound channel message handling.
//!
//! Every message first raises [`CloudEvent::ChannelMessageReceived`], so
//! handlers registered for custom channels can answer queries. Messages on
//! the internal channel are then routed by name to the node, task and
//! service listeners. Names this build does not know are ignored.

mod node;
mod service;
mod task;

use std::sync::Arc;

use bytes::Bytes;
use cloudnet_protocol::{
    ChannelMessage, InboundHandler, InboundMessage, InternalMessage, NetworkChannel,
    inbound_handler,
};
use serde::de::DeserializeOwned;
use tracing::{trace, warn};

pub use node::NodeChannelMessageListener;
pub use service::ServiceChannelMessageListener;
pub use task::TaskChannelMessageListener;

use crate::events::{CloudEvent, EventManager};

/// Routes inbound messages to the listeners.
pub struct ChannelMessageDispatcher {
    events: Arc<EventManager>,
    node: NodeChannelMessageListener,
    task: TaskChannelMessageListener,
    service: ServiceChannelMessageListener,
}

impl ChannelMessageDispatcher {
    pub fn new(
        events: Arc<EventManager>,
        node: NodeChannelMessageListener,
        task: TaskChannelMessageListener,
        service: ServiceChannelMessageListener,
    ) -> Self {
        Self {
            events,
            node,
            task,
            service,
        }
    }

    /// Handle one inbound message and produce the query response, if any.
    ///
    /// A response from an internal listener wins over one set by an event
    /// handler.
    pub async fn dispatch(&self, channel: &NetworkChannel, inbound: InboundMessage) -> Option<Bytes> {
        let InboundMessage { message, query } = inbound;

        let custom = self
            .events
            .publish(&CloudEvent::ChannelMessageReceived {
                message: message.clone(),
                query,
            })
            .into_response();

        let Some(kind) = message.internal_kind() else {
            return custom;
        };

        let internal = match kind {
            InternalMessage::UpdateNodeInfoSnapshot => {
                self.node.update_node_info_snapshot(&message);
                None
            }
            InternalMessage::SyncClusterData => self.node.sync_cluster_data(&message, query),
            InternalMessage::RegisterKnownNode => {
                self.node.register_known_node(&message);
                None
            }
            InternalMessage::RemoveKnownNode => {
                self.node.remove_known_node(&message);
                None
            }
            InternalMessage::ClusterNodeShutdown => {
                self.node.cluster_node_shutdown(&message);
                None
            }
            InternalMessage::RequestInitialClusterData => {
                self.node.request_initial_cluster_data(channel);
                None
            }
            InternalMessage::SendCommandLine => self.node.send_command_line(&message),
            InternalMessage::ChangeDrainingState => {
                self.node.change_draining_state(&message);
                None
            }
            InternalMessage::SetServiceTasks => {
                self.task.set_service_tasks(&message);
                None
            }
            InternalMessage::AddServiceTask => {
                self.task.add_service_task(&message);
                None
            }
            InternalMessage::RemoveServiceTask => {
                self.task.remove_service_task(&message);
                None
            }
            InternalMessage::UpdateServiceInfo => {
                self.service.update_service_info(&message);
                None
            }
            InternalMessage::Unrecognized(name) => {
                trace!(message = %name, sender = %message.sender(), "Ignoring unknown internal message");
                None
            }
        };

        internal.or(custom)
    }

    /// Inbound handler to hand to every channel this node opens or accepts.
    pub fn inbound_handler(self: &Arc<Self>) -> InboundHandler {
        let dispatcher = self.clone();
        inbound_handler(move |channel, inbound| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(&channel, inbound).await }
        })
    }
}

impl std::fmt::Debug for ChannelMessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMessageDispatcher").finish_non_exhaustive()
    }
}

/// Decode JSON message content. Malformed content is logged and dropped.
pub(crate) fn decode<T: DeserializeOwned>(message: &ChannelMessage) -> Option<T> {
    match serde_json::from_slice(message.content()) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                message = %message.message(),
                sender = %message.sender(),
                error = %e,
                "Dropping malformed channel message"
            );
            None
        }
    }
}
