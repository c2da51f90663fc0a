// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster message handling between two linked nodes.

mod common;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use cloudnet_node::cluster::NetworkClusterNode;
use cloudnet_node::events::{CloudEvent, EventKind};
use cloudnet_node::lifecycle::ServiceLifeCycle;
use cloudnet_node::service::ServiceConfiguration;
use cloudnet_node::task::ServiceTask;
use cloudnet_protocol::{ChannelMessage, INTERNAL_CHANNEL, InternalMessage};
use common::*;

fn task_names(node: &TestNode) -> Vec<String> {
    let mut names: Vec<String> = node.ctx.tasks().tasks().into_iter().map(|t| t.name).collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_sync_pushes_missing_tasks() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    a.ctx.tasks().add_task_silently(ServiceTask::new("Lobby", "java"));
    a.ctx.tasks().add_task_silently(ServiceTask::new("Proxy", "java"));
    let (a_to_b, _) = link(&a, &b);

    a.ctx
        .sync()
        .sync_with(&a_to_b, a.id(), false, TIMEOUT)
        .await
        .unwrap();

    assert_eq!(task_names(&b), vec!["Lobby", "Proxy"]);
    assert_eq!(task_names(&a), vec!["Lobby", "Proxy"]);
    assert_eq!(b.ctx.tasks().task("Lobby"), a.ctx.tasks().task("Lobby"));
}

#[tokio::test]
async fn test_sync_backfills_sender() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    a.ctx.tasks().add_task_silently(ServiceTask::new("Lobby", "java"));
    b.ctx.tasks().add_task_silently(ServiceTask::new("BedWars", "java"));
    let (a_to_b, _) = link(&a, &b);

    a.ctx
        .sync()
        .sync_with(&a_to_b, a.id(), false, TIMEOUT)
        .await
        .unwrap();

    assert_eq!(task_names(&a), vec!["BedWars", "Lobby"]);
    assert_eq!(task_names(&b), vec!["BedWars", "Lobby"]);
}

#[tokio::test]
async fn test_sync_without_force_keeps_receiver_version_of_equal_names() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    let mut lobby = ServiceTask::new("Lobby", "java");
    lobby.min_service_count = 2;
    a.ctx.tasks().add_task_silently(lobby.clone());
    b.ctx.tasks().add_task_silently(ServiceTask::new("Lobby", "java"));
    let (a_to_b, _) = link(&a, &b);

    // differing items are applied, so last applier wins
    a.ctx
        .sync()
        .sync_with(&a_to_b, a.id(), false, TIMEOUT)
        .await
        .unwrap();

    assert_eq!(b.ctx.tasks().task("Lobby"), Some(lobby));
}

#[tokio::test]
async fn test_dialer_receives_initial_cluster_data() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    a.ctx.tasks().add_task_silently(ServiceTask::new("Lobby", "java"));
    b.ctx.tasks().add_task_silently(ServiceTask::new("Proxy", "java"));

    dial(&a, &b);

    eventually(|| a.ctx.tasks().task("Proxy").is_some()).await;
    eventually(|| b.ctx.tasks().task("Lobby").is_some()).await;
    assert_eq!(task_names(&a), task_names(&b));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_initial_data_request_queued_before_acceptor_binds() {
    for round in 0..10 {
        let a = TestNode::new("Node-1", &["Node-2"]);
        let b = TestNode::new("Node-2", &["Node-1"]);
        b.ctx
            .tasks()
            .add_task_silently(ServiceTask::new(format!("Proxy-{}", round), "java"));

        dial(&a, &b);

        let expected = format!("Proxy-{}", round);
        eventually(|| a.ctx.tasks().task(&expected).is_some()).await;
    }
}

#[tokio::test]
async fn test_sync_cluster_data_broadcast() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    let (a_to_b, _) = link(&a, &b);
    a.ctx.tasks().add_task_silently(ServiceTask::new("Lobby", "java"));

    assert_eq!(a.ctx.sync_cluster_data(false).unwrap(), 1);
    barrier(&a_to_b).await;

    assert!(b.ctx.tasks().task("Lobby").is_some());
}

#[tokio::test]
async fn test_task_changes_propagate() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    let (a_to_b, _) = link(&a, &b);

    a.ctx.tasks().add_task(ServiceTask::new("Lobby", "java"));
    barrier(&a_to_b).await;
    assert_eq!(task_names(&b), vec!["Lobby"]);

    a.ctx.tasks().set_tasks(vec![
        ServiceTask::new("Proxy", "java"),
        ServiceTask::new("BedWars", "java"),
    ]);
    barrier(&a_to_b).await;
    assert_eq!(task_names(&b), vec!["BedWars", "Proxy"]);

    a.ctx.tasks().remove_task("Proxy");
    barrier(&a_to_b).await;
    assert_eq!(task_names(&b), vec!["BedWars"]);
}

#[tokio::test]
async fn test_node_snapshot_replaced_once() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    let (a_to_b, _) = link(&a, &b);

    let updates = Arc::new(Mutex::new(0usize));
    let counter = updates.clone();
    b.ctx
        .events()
        .register(EventKind::NodeInfoSnapshotUpdated, move |_, _| {
            *counter.lock().unwrap() += 1;
        });

    let snapshot = a.ctx.servers().publish_local_snapshot(3);
    barrier(&a_to_b).await;

    let stored = b.ctx.nodes().node_info_snapshot("Node-1").unwrap();
    assert_eq!(stored, snapshot);
    assert_eq!(stored.current_services, 3);
    assert_eq!(*updates.lock().unwrap(), 1);

    // replaying the same snapshot is stale
    let replay = ChannelMessage::internal(
        InternalMessage::UpdateNodeInfoSnapshot,
        serde_json::to_vec(&snapshot).unwrap(),
    );
    a_to_b.send_message(&replay).unwrap();
    barrier(&a_to_b).await;
    assert_eq!(*updates.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_snapshot_of_unknown_node_is_dropped() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    let (a_to_b, _) = link(&a, &b);

    let updates = Arc::new(Mutex::new(0usize));
    let counter = updates.clone();
    b.ctx
        .events()
        .register(EventKind::NodeInfoSnapshotUpdated, move |_, _| {
            *counter.lock().unwrap() += 1;
        });

    let mut snapshot = a.ctx.servers().local().create_snapshot(0);
    snapshot.node = NetworkClusterNode::new("Node-9", vec![]);
    a_to_b
        .send_message(&ChannelMessage::internal(
            InternalMessage::UpdateNodeInfoSnapshot,
            serde_json::to_vec(&snapshot).unwrap(),
        ))
        .unwrap();
    barrier(&a_to_b).await;

    assert!(b.ctx.nodes().node_info_snapshot("Node-9").is_none());
    assert!(b.ctx.nodes().node("Node-9").is_none());
    assert_eq!(*updates.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_internal_message_is_ignored() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    let (a_to_b, _) = link(&a, &b);

    let message = ChannelMessage::new(INTERNAL_CHANNEL, "teleport_services", Bytes::from_static(b"{}"));
    let response = a_to_b.send_query(&message, TIMEOUT).await.unwrap();

    assert!(response.is_none());
    assert!(b.ctx.tasks().tasks().is_empty());
    assert!(!b.ctx.is_shutdown_requested());
    assert!(!b.ctx.servers().local().is_draining());
}

#[tokio::test]
async fn test_malformed_content_is_dropped() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    let (a_to_b, _) = link(&a, &b);

    a_to_b
        .send_message(&ChannelMessage::internal(
            InternalMessage::AddServiceTask,
            Bytes::from_static(b"not json"),
        ))
        .unwrap();
    barrier(&a_to_b).await;

    assert!(b.ctx.tasks().tasks().is_empty());
}

#[tokio::test]
async fn test_command_line_relay() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    link(&a, &b);

    let remote = a
        .ctx
        .nodes()
        .send_command_line_to_node("Node-2", "list")
        .await
        .unwrap();
    assert_eq!(remote, vec!["Node-2: list"]);

    let local = a
        .ctx
        .nodes()
        .send_command_line_to_node("Node-1", "list")
        .await
        .unwrap();
    assert_eq!(local, vec!["Node-1: list"]);
}

#[tokio::test]
async fn test_command_line_to_unknown_node_fails() {
    let a = TestNode::new("Node-1", &["Node-2"]);

    let result = a.ctx.nodes().send_command_line_to_node("Node-9", "list").await;
    assert!(matches!(result, Err(cloudnet_node::Error::UnknownNode(id)) if id == "Node-9"));

    let result = a.ctx.nodes().send_command_line_to_node("Node-2", "list").await;
    assert!(matches!(result, Err(cloudnet_node::Error::NodeUnavailable(id)) if id == "Node-2"));
}

#[tokio::test]
async fn test_change_draining_state() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    let (a_to_b, _) = link(&a, &b);

    let changes = Arc::new(Mutex::new(Vec::new()));
    let recorded = changes.clone();
    b.ctx.events().register(EventKind::NodeDrainChanged, move |event, _| {
        if let CloudEvent::NodeDrainChanged { draining } = event {
            recorded.lock().unwrap().push(*draining);
        }
    });

    a.ctx.servers().change_draining_state("Node-2", true).unwrap();
    barrier(&a_to_b).await;
    assert!(b.ctx.servers().local().is_draining());

    a.ctx.servers().change_draining_state("Node-2", false).unwrap();
    barrier(&a_to_b).await;
    assert!(!b.ctx.servers().local().is_draining());
    assert_eq!(*changes.lock().unwrap(), vec![true, false]);
}

#[tokio::test]
async fn test_shutdown_request_from_peer() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    link(&a, &b);

    let mut requested = b.ctx.shutdown_requested();
    a.ctx.servers().shutdown_node("Node-2").unwrap();

    tokio::time::timeout(TIMEOUT, requested.wait_for(|requested| *requested))
        .await
        .unwrap()
        .unwrap();
    assert!(!a.ctx.is_shutdown_requested());
}

#[tokio::test]
async fn test_known_node_registration_propagates() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    let (a_to_b, _) = link(&a, &b);

    let node = NetworkClusterNode::new("Node-3", vec![SocketAddr::from(([10, 0, 0, 3], 1410))]);
    assert!(a.ctx.nodes().add_node(node.clone()));
    barrier(&a_to_b).await;
    assert_eq!(b.ctx.nodes().node("Node-3"), Some(node));

    assert!(a.ctx.nodes().remove_node("Node-3").is_some());
    barrier(&a_to_b).await;
    assert!(b.ctx.nodes().node("Node-3").is_none());
    assert!(b.ctx.nodes().node("Node-1").is_some());
}

#[tokio::test]
async fn test_custom_channel_query_answered_by_event_handler() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    let (a_to_b, _) = link(&a, &b);

    b.ctx
        .events()
        .register(EventKind::ChannelMessageReceived, |event, outcome| {
            if let CloudEvent::ChannelMessageReceived { message, query } = event
                && *query
                && message.channel() == "stats"
            {
                outcome.respond(Bytes::from(format!("players:{}", message.message())));
            }
        });

    let response = a_to_b
        .send_query(&ChannelMessage::new("stats", "Lobby", Bytes::new()), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response, Some(Bytes::from_static(b"players:Lobby")));
}

#[tokio::test]
async fn test_service_snapshots_reach_peer() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    let (a_to_b, _) = link(&a, &b);

    let configuration = ServiceConfiguration::builder()
        .task_name("Lobby")
        .command("java")
        .auto_delete_on_stop(false)
        .build()
        .unwrap();
    let id = a.ctx.services().create_service(configuration).await.unwrap();
    a.ctx.services().start_service(id.unique_id()).await.unwrap();
    barrier(&a_to_b).await;

    let remote = b.ctx.services().remote_snapshots();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].service_id.unique_id(), id.unique_id());
    assert_eq!(remote[0].service_id.node_unique_id(), "Node-1");
    assert_eq!(remote[0].lifecycle, ServiceLifeCycle::Running);

    // a peer's service occupies its task index
    let configuration = ServiceConfiguration::builder()
        .task_name("Lobby")
        .command("java")
        .build()
        .unwrap();
    let local = b.ctx.services().create_service(configuration).await.unwrap();
    assert_eq!(local.name(), "Lobby-2");

    a.ctx.services().delete_service(id.unique_id()).await.unwrap();
    barrier(&a_to_b).await;
    assert!(b.ctx.services().remote_snapshots().is_empty());
}

async fn start_lobby(node: &TestNode) {
    let configuration = ServiceConfiguration::builder()
        .task_name("Lobby")
        .command("java")
        .auto_delete_on_stop(false)
        .build()
        .unwrap();
    let id = node.ctx.services().create_service(configuration).await.unwrap();
    node.ctx.services().start_service(id.unique_id()).await.unwrap();
}

async fn create_lobby_name(node: &TestNode) -> String {
    let configuration = ServiceConfiguration::builder()
        .task_name("Lobby")
        .command("java")
        .build()
        .unwrap();
    let id = node.ctx.services().create_service(configuration).await.unwrap();
    id.name()
}

#[tokio::test]
async fn test_removed_node_releases_its_task_indices() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    let (a_to_b, _) = link(&a, &b);

    start_lobby(&a).await;
    barrier(&a_to_b).await;
    assert_eq!(b.ctx.services().remote_snapshots().len(), 1);

    assert!(b.ctx.nodes().remove_node("Node-1").is_some());

    assert!(b.ctx.services().remote_snapshots().is_empty());
    assert_eq!(create_lobby_name(&b).await, "Lobby-1");
}

#[tokio::test]
async fn test_disconnected_node_releases_its_task_indices() {
    let a = TestNode::new("Node-1", &["Node-2"]);
    let b = TestNode::new("Node-2", &["Node-1"]);
    let (a_to_b, _) = link(&a, &b);

    start_lobby(&a).await;
    barrier(&a_to_b).await;
    assert_eq!(b.ctx.services().remote_snapshots().len(), 1);

    a_to_b.close();

    eventually(|| b.ctx.services().remote_snapshots().is_empty()).await;
    assert!(b.ctx.nodes().node("Node-1").is_some());
    assert_eq!(create_lobby_name(&b).await, "Lobby-1");
}
