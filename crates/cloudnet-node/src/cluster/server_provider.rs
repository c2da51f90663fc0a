// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node servers: the local node and one entry per known peer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use cloudnet_protocol::{ChannelMessage, InternalMessage, NetworkChannel};
use tracing::{debug, info, warn};

use super::{NetworkClusterNode, NetworkClusterNodeInfoSnapshot};
use crate::error::{Error, Result};
use crate::events::{CloudEvent, EventManager};

/// Executes console command lines.
pub trait CommandExecutor: Send + Sync {
    /// Run `command_line` and return its output lines.
    fn execute(&self, command_line: &str) -> Vec<String>;
}

impl<F> CommandExecutor for F
where
    F: Fn(&str) -> Vec<String> + Send + Sync,
{
    fn execute(&self, command_line: &str) -> Vec<String> {
        self(command_line)
    }
}

/// The node this process runs.
pub struct LocalNodeServer {
    node: NetworkClusterNode,
    draining: AtomicBool,
    executor: Arc<dyn CommandExecutor>,
    events: Arc<EventManager>,
    startup_millis: i64,
    sequence: AtomicU64,
    max_memory_mb: u32,
}

impl LocalNodeServer {
    pub fn new(
        node: NetworkClusterNode,
        max_memory_mb: u32,
        executor: Arc<dyn CommandExecutor>,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            node,
            draining: AtomicBool::new(false),
            executor,
            events,
            startup_millis: Utc::now().timestamp_millis(),
            sequence: AtomicU64::new(0),
            max_memory_mb,
        }
    }

    pub fn node(&self) -> &NetworkClusterNode {
        &self.node
    }

    pub fn unique_id(&self) -> &str {
        &self.node.unique_id
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Toggle whether new services may be placed here. Running services are
    /// not touched. Returns whether the flag changed.
    pub fn drain(&self, draining: bool) -> bool {
        let changed = self.draining.swap(draining, Ordering::SeqCst) != draining;
        if changed {
            info!(node_id = %self.node.unique_id, draining, "Node drain state changed");
            self.events
                .publish(&CloudEvent::NodeDrainChanged { draining });
        }
        changed
    }

    pub fn send_command_line(&self, command_line: &str) -> Vec<String> {
        self.executor.execute(command_line)
    }

    /// A fresh snapshot with the next sequence number.
    pub fn create_snapshot(&self, current_services: u32) -> NetworkClusterNodeInfoSnapshot {
        NetworkClusterNodeInfoSnapshot {
            node: self.node.clone(),
            creation_time: Utc::now(),
            startup_millis: self.startup_millis,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            max_memory_mb: self.max_memory_mb,
            current_services,
            draining: self.is_draining(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A peer node: its link, if connected, and its last snapshot.
#[derive(Debug)]
pub struct RemoteNodeServer {
    node: NetworkClusterNode,
    channel: Mutex<Option<NetworkChannel>>,
    snapshot: Mutex<Option<NetworkClusterNodeInfoSnapshot>>,
}

impl RemoteNodeServer {
    fn new(node: NetworkClusterNode) -> Self {
        Self {
            node,
            channel: Mutex::new(None),
            snapshot: Mutex::new(None),
        }
    }

    pub fn node(&self) -> &NetworkClusterNode {
        &self.node
    }

    pub fn unique_id(&self) -> &str {
        &self.node.unique_id
    }

    /// The live link, if any.
    pub fn channel(&self) -> Option<NetworkChannel> {
        lock(&self.channel)
            .as_ref()
            .filter(|channel| !channel.is_closed())
            .cloned()
    }

    pub fn is_available(&self) -> bool {
        self.channel().is_some()
    }

    pub fn node_info_snapshot(&self) -> Option<NetworkClusterNodeInfoSnapshot> {
        lock(&self.snapshot).clone()
    }

    /// Replace the stored snapshot if `snapshot` is newer. Returns whether it
    /// was replaced.
    pub fn update_node_info_snapshot(&self, snapshot: NetworkClusterNodeInfoSnapshot) -> bool {
        let mut current = lock(&self.snapshot);
        if let Some(existing) = current.as_ref()
            && !snapshot.is_newer_than(existing)
        {
            return false;
        }
        *current = Some(snapshot);
        true
    }

    fn set_channel(&self, channel: NetworkChannel) -> Option<NetworkChannel> {
        lock(&self.channel).replace(channel)
    }

    fn clear_channel_if(&self, channel: &NetworkChannel) -> bool {
        let mut current = lock(&self.channel);
        if current.as_ref() == Some(channel) {
            *current = None;
            true
        } else {
            false
        }
    }

    fn take_channel(&self) -> Option<NetworkChannel> {
        lock(&self.channel).take()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// All node servers known to this node.
pub struct NodeServerProvider {
    local: LocalNodeServer,
    remotes: RwLock<BTreeMap<String, Arc<RemoteNodeServer>>>,
    events: Arc<EventManager>,
    query_timeout: Duration,
}

impl NodeServerProvider {
    pub fn new(local: LocalNodeServer, events: Arc<EventManager>, query_timeout: Duration) -> Self {
        Self {
            local,
            remotes: RwLock::new(BTreeMap::new()),
            events,
            query_timeout,
        }
    }

    pub fn local(&self) -> &LocalNodeServer {
        &self.local
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    pub fn node(&self, unique_id: &str) -> Option<Arc<RemoteNodeServer>> {
        self.read().get(unique_id).cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<RemoteNodeServer>> {
        self.read().values().cloned().collect()
    }

    /// The peer a channel belongs to, if it is that peer's current link.
    pub fn node_by_channel(&self, channel: &NetworkChannel) -> Option<Arc<RemoteNodeServer>> {
        self.node(channel.peer())
            .filter(|remote| remote.channel().as_ref() == Some(channel))
    }

    /// Track a peer. Returns the existing entry when already known.
    pub fn register_node(&self, node: NetworkClusterNode) -> Arc<RemoteNodeServer> {
        self.write()
            .entry(node.unique_id.clone())
            .or_insert_with(|| Arc::new(RemoteNodeServer::new(node)))
            .clone()
    }

    /// Stop tracking a peer and close its link.
    pub fn unregister_node(&self, unique_id: &str) -> Option<Arc<RemoteNodeServer>> {
        let remote = self.write().remove(unique_id)?;
        if let Some(channel) = remote.take_channel() {
            channel.close();
        }
        Some(remote)
    }

    /// Bind an authenticated channel to its peer, replacing an older link.
    ///
    /// The binding is dropped again once the channel closes.
    pub fn attach_channel(&self, channel: NetworkChannel) -> Result<Arc<RemoteNodeServer>> {
        let remote = self
            .node(channel.peer())
            .ok_or_else(|| Error::UnknownNode(channel.peer().to_string()))?;

        if let Some(previous) = remote.set_channel(channel.clone())
            && previous != channel
        {
            debug!(node_id = %remote.unique_id(), "Replacing existing node link");
            previous.close();
        }
        info!(node_id = %remote.unique_id(), "Node connected");

        let watched = remote.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            channel.closed().await;
            if watched.clear_channel_if(&channel) {
                info!(node_id = %watched.unique_id(), "Node disconnected");
                events.publish(&CloudEvent::NodeDisconnected {
                    unique_id: watched.unique_id().to_string(),
                });
            }
        });
        Ok(remote)
    }

    /// Live links of every connected peer.
    pub fn connected_channels(&self) -> Vec<NetworkChannel> {
        self.read()
            .values()
            .filter_map(|remote| remote.channel())
            .collect()
    }

    /// Send a message to every connected peer. Returns the number of peers
    /// it was handed to.
    pub fn broadcast(&self, message: &ChannelMessage) -> usize {
        let message = message.clone().with_sender(self.local.unique_id());
        let mut sent = 0;
        for channel in self.connected_channels() {
            match channel.send_message(&message) {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %channel.peer(), error = %e, "Broadcast skipped peer"),
            }
        }
        sent
    }

    /// Send a message to one peer.
    pub fn send_to_node(&self, unique_id: &str, message: &ChannelMessage) -> Result<()> {
        let channel = self.channel_of(unique_id)?;
        let message = message.clone().with_sender(self.local.unique_id());
        Ok(channel.send_message(&message)?)
    }

    /// Query one peer and wait for its response.
    pub async fn query_node(
        &self,
        unique_id: &str,
        message: &ChannelMessage,
    ) -> Result<Option<Bytes>> {
        let channel = self.channel_of(unique_id)?;
        let message = message.clone().with_sender(self.local.unique_id());
        Ok(channel.send_query(&message, self.query_timeout).await?)
    }

    /// Run a command line on a node, locally when `unique_id` is this node.
    pub async fn send_command_line_to_node(
        &self,
        unique_id: &str,
        command_line: &str,
    ) -> Result<Vec<String>> {
        if unique_id == self.local.unique_id() {
            return Ok(self.local.send_command_line(command_line));
        }

        let content = serde_json::to_vec(command_line)?;
        let response = self
            .query_node(
                unique_id,
                &ChannelMessage::internal(InternalMessage::SendCommandLine, content),
            )
            .await?;
        match response {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// Ask a peer to change its drain state.
    pub fn change_draining_state(&self, unique_id: &str, draining: bool) -> Result<()> {
        if unique_id == self.local.unique_id() {
            self.local.drain(draining);
            return Ok(());
        }
        let content = serde_json::to_vec(&draining)?;
        self.send_to_node(
            unique_id,
            &ChannelMessage::internal(InternalMessage::ChangeDrainingState, content),
        )
    }

    /// Ask a peer to shut down.
    pub fn shutdown_node(&self, unique_id: &str) -> Result<()> {
        self.send_to_node(
            unique_id,
            &ChannelMessage::internal(InternalMessage::ClusterNodeShutdown, Bytes::new()),
        )
    }

    /// Apply a peer snapshot. Stale snapshots and unknown nodes are dropped.
    ///
    /// Raises [`CloudEvent::NodeInfoSnapshotUpdated`] only on replacement.
    pub fn update_node_info_snapshot(&self, snapshot: NetworkClusterNodeInfoSnapshot) -> bool {
        let Some(remote) = self.node(&snapshot.node.unique_id) else {
            debug!(node_id = %snapshot.node.unique_id, "Snapshot for unknown node dropped");
            return false;
        };
        if !remote.update_node_info_snapshot(snapshot.clone()) {
            debug!(
                node_id = %snapshot.node.unique_id,
                sequence = snapshot.sequence,
                "Stale node snapshot dropped"
            );
            return false;
        }
        self.events
            .publish(&CloudEvent::NodeInfoSnapshotUpdated { snapshot });
        true
    }

    /// Create the next local snapshot and broadcast it.
    pub fn publish_local_snapshot(&self, current_services: u32) -> NetworkClusterNodeInfoSnapshot {
        let snapshot = self.local.create_snapshot(current_services);
        match serde_json::to_vec(&snapshot) {
            Ok(content) => {
                self.broadcast(&ChannelMessage::internal(
                    InternalMessage::UpdateNodeInfoSnapshot,
                    content,
                ));
            }
            Err(e) => warn!(error = %e, "Failed to encode node snapshot"),
        }
        snapshot
    }

    /// Close every peer link. Outstanding queries fail as cancelled.
    pub fn close_all(&self) {
        for remote in self.nodes() {
            if let Some(channel) = remote.take_channel() {
                channel.close();
            }
        }
    }

    fn channel_of(&self, unique_id: &str) -> Result<NetworkChannel> {
        let remote = self
            .node(unique_id)
            .ok_or_else(|| Error::UnknownNode(unique_id.to_string()))?;
        remote
            .channel()
            .ok_or_else(|| Error::NodeUnavailable(unique_id.to_string()))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<RemoteNodeServer>>> {
        self.remotes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<RemoteNodeServer>>> {
        self.remotes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for NodeServerProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeServerProvider")
            .field("local", &self.local.unique_id())
            .field("remotes", &self.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    fn provider() -> (NodeServerProvider, Arc<EventManager>) {
        let events = Arc::new(EventManager::new());
        let executor: Arc<dyn CommandExecutor> =
            Arc::new(|line: &str| vec![format!("executed {}", line)]);
        let local = LocalNodeServer::new(
            NetworkClusterNode::new("Node-1", vec![]),
            2048,
            executor,
            events.clone(),
        );
        (
            NodeServerProvider::new(local, events.clone(), Duration::from_secs(5)),
            events,
        )
    }

    fn counter(events: &EventManager, kind: EventKind) -> Arc<AtomicU64> {
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        events.register(kind, move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_drain_fires_event_on_change_only() {
        let (servers, events) = provider();
        let changes = counter(&events, EventKind::NodeDrainChanged);

        assert!(servers.local().drain(true));
        assert!(!servers.local().drain(true));
        assert!(servers.local().is_draining());
        assert!(servers.local().drain(false));
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_local_snapshot_sequence_increases() {
        let (servers, _) = provider();
        let first = servers.local().create_snapshot(0);
        let second = servers.local().create_snapshot(3);
        assert!(second.is_newer_than(&first));
        assert_eq!(second.current_services, 3);
        assert_eq!(first.node.unique_id, "Node-1");
    }

    #[test]
    fn test_snapshot_update_known_unknown_and_stale() {
        let (servers, events) = provider();
        let updates = counter(&events, EventKind::NodeInfoSnapshotUpdated);
        servers.register_node(NetworkClusterNode::new("Node-2", vec![]));

        let snapshot = |id: &str, sequence| NetworkClusterNodeInfoSnapshot {
            node: NetworkClusterNode::new(id, vec![]),
            creation_time: Utc::now(),
            startup_millis: 1,
            sequence,
            max_memory_mb: 1024,
            current_services: 0,
            draining: false,
            version: "4.0.0".to_string(),
        };

        assert!(servers.update_node_info_snapshot(snapshot("Node-2", 2)));
        assert!(!servers.update_node_info_snapshot(snapshot("Node-2", 1)));
        assert!(!servers.update_node_info_snapshot(snapshot("Node-3", 5)));

        assert_eq!(updates.load(Ordering::SeqCst), 1);
        let stored = servers.node("Node-2").unwrap().node_info_snapshot().unwrap();
        assert_eq!(stored.sequence, 2);
        assert!(servers.node("Node-3").is_none());
    }

    #[tokio::test]
    async fn test_command_line_runs_locally_for_own_id() {
        let (servers, _) = provider();
        let output = servers
            .send_command_line_to_node("Node-1", "list")
            .await
            .unwrap();
        assert_eq!(output, vec!["executed list".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_and_unavailable_nodes() {
        let (servers, _) = provider();
        servers.register_node(NetworkClusterNode::new("Node-2", vec![]));

        assert!(matches!(
            servers.send_command_line_to_node("Node-9", "list").await,
            Err(Error::UnknownNode(_))
        ));
        assert!(matches!(
            servers.send_command_line_to_node("Node-2", "list").await,
            Err(Error::NodeUnavailable(_))
        ));
        assert_eq!(servers.broadcast(&ChannelMessage::new("a", "b", Bytes::new())), 0);
    }
}
