// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node links over a loopback QUIC endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cloudnet_protocol::{
    ChannelMessage, ClientError, ClusterClient, ClusterServer, InboundMessage, NetworkChannel,
    inbound_handler,
};
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Start a server named `Node-1` that accepts `allowed` peers and echoes queries.
async fn start_server(
    allowed: &'static [&'static str],
) -> (SocketAddr, Arc<ClusterServer>, mpsc::UnboundedReceiver<NetworkChannel>) {
    let server = Arc::new(ClusterServer::localhost("127.0.0.1:0".parse().unwrap()).unwrap());
    let addr = server.local_addr().unwrap();
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();

    let running = server.clone();
    tokio::spawn(async move {
        running
            .run(move |conn| {
                let accepted_tx = accepted_tx.clone();
                async move {
                    let echo = inbound_handler(|_, inbound: InboundMessage| async move {
                        Some(inbound.message.content().clone())
                    });
                    let result = conn
                        .accept_channel(
                            "Node-1",
                            |auth| {
                                if allowed.contains(&auth.node_unique_id.as_str()) {
                                    Ok(())
                                } else {
                                    Err("unknown node".to_string())
                                }
                            },
                            echo,
                        )
                        .await;
                    if let Ok(channel) = result {
                        let _ = accepted_tx.send(channel);
                    }
                }
            })
            .await
            .unwrap();
    });

    (addr, server, accepted_rx)
}

#[tokio::test]
async fn test_authenticated_link_answers_queries() {
    let (addr, server, mut accepted) = start_server(&["Node-2"]).await;
    let client = ClusterClient::localhost().unwrap();

    let channel = client
        .connect(addr, "Node-2", inbound_handler(|_, _| async { None }))
        .await
        .unwrap();
    assert_eq!(channel.peer(), "Node-1");

    let remote = tokio::time::timeout(TIMEOUT, accepted.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remote.peer(), "Node-2");

    let msg = ChannelMessage::new("bridge", "ping", Bytes::from_static(b"hello"));
    let reply = channel.send_query(&msg, TIMEOUT).await.unwrap();
    assert_eq!(reply, Some(Bytes::from_static(b"hello")));

    channel.close();
    server.close();
}

#[tokio::test]
async fn test_unknown_node_is_rejected() {
    let (addr, server, _accepted) = start_server(&["Node-2"]).await;
    let client = ClusterClient::localhost().unwrap();

    let result = client
        .connect(addr, "Node-7", inbound_handler(|_, _| async { None }))
        .await;

    match result {
        Err(ClientError::Rejected { node, reason }) => {
            assert_eq!(node, "Node-1");
            assert_eq!(reason, "unknown node");
        }
        other => panic!("expected rejection, got {:?}", other.map(|c| c.peer().to_string())),
    }

    server.close();
}

#[tokio::test]
async fn test_closing_one_side_closes_the_other() {
    let (addr, server, mut accepted) = start_server(&["Node-2"]).await;
    let client = ClusterClient::localhost().unwrap();

    let channel = client
        .connect(addr, "Node-2", inbound_handler(|_, _| async { None }))
        .await
        .unwrap();
    let remote = tokio::time::timeout(TIMEOUT, accepted.recv())
        .await
        .unwrap()
        .unwrap();

    channel.close();
    tokio::time::timeout(TIMEOUT, remote.closed()).await.unwrap();
    assert!(remote.is_closed());

    server.close();
}

#[tokio::test]
async fn test_failed_bind_closes_both_sides() {
    let (addr, server, mut accepted) = start_server(&["Node-2"]).await;
    let client = ClusterClient::localhost().unwrap();

    let result = client
        .connect_bound(addr, "Node-2", inbound_handler(|_, _| async { None }), |channel| {
            Err(format!("expected Node-3 but peer announced {}", channel.peer()))
        })
        .await;
    match result {
        Err(ClientError::Unbound { node, reason }) => {
            assert_eq!(node, "Node-1");
            assert_eq!(reason, "expected Node-3 but peer announced Node-1");
        }
        other => panic!("expected unbound link, got {:?}", other.map(|c| c.peer().to_string())),
    }

    let remote = tokio::time::timeout(TIMEOUT, accepted.recv())
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(TIMEOUT, remote.closed()).await.unwrap();
    assert!(remote.is_closed());

    server.close();
}
