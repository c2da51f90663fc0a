// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker publishing node and service snapshots.
//!
//! Every tick the publisher:
//! - moves services whose process exited on its own to `STOPPED`
//! - broadcasts the local node snapshot with the current service count
//! - broadcasts a fresh snapshot of every `RUNNING` service

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::cluster::NodeServerProvider;
use crate::service::CloudServiceManager;

/// Configuration for the snapshot publisher.
#[derive(Debug, Clone)]
pub struct SnapshotPublisherConfig {
    /// How often snapshots are published.
    pub interval: Duration,
}

impl Default for SnapshotPublisherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Outcome of one publication round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishRound {
    /// Services found exited since the last round.
    pub exited: usize,
    /// `RUNNING` services whose snapshot was published.
    pub service_snapshots: usize,
}

/// Periodically announces this node's state to the cluster.
pub struct SnapshotPublisher {
    servers: Arc<NodeServerProvider>,
    services: Arc<CloudServiceManager>,
    config: SnapshotPublisherConfig,
    shutdown: Arc<Notify>,
}

impl SnapshotPublisher {
    pub fn new(
        servers: Arc<NodeServerProvider>,
        services: Arc<CloudServiceManager>,
        config: SnapshotPublisherConfig,
    ) -> Self {
        Self {
            servers,
            services,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the publisher loop until shutdown.
    pub async fn run(&self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Snapshot publisher started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Snapshot publisher received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    let round = self.publish_once().await;
                    debug!(
                        exited = round.exited,
                        service_snapshots = round.service_snapshots,
                        "Snapshot round complete"
                    );
                }
            }
        }

        info!("Snapshot publisher stopped");
    }

    /// Run one publication round.
    pub async fn publish_once(&self) -> PublishRound {
        let exited = self.services.check_processes().await;
        let count = u32::try_from(self.services.count()).unwrap_or(u32::MAX);
        self.servers.publish_local_snapshot(count);
        let service_snapshots = self.services.publish_running_snapshots().await;
        PublishRound {
            exited,
            service_snapshots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{LocalNodeServer, NetworkClusterNode};
    use crate::events::{EventKind, EventManager};
    use crate::runner::mock::MockRunner;
    use crate::service::{ServiceConfiguration, ServiceContext};
    use crate::template::{FileInclusionFetcher, TemplateStorageRegistry};
    use std::sync::Mutex;

    type Fixture = (
        Arc<MockRunner>,
        Arc<EventManager>,
        SnapshotPublisher,
        Arc<CloudServiceManager>,
    );

    fn setup(dir: &std::path::Path) -> Fixture {
        let events = Arc::new(EventManager::new());
        let servers = Arc::new(NodeServerProvider::new(
            LocalNodeServer::new(
                NetworkClusterNode::new("Node-1", vec![]),
                1024,
                Arc::new(|_: &str| Vec::<String>::new()),
                events.clone(),
            ),
            events.clone(),
            Duration::from_secs(1),
        ));
        let runner = Arc::new(MockRunner::new());
        let ctx = Arc::new(ServiceContext {
            runner: runner.clone(),
            storages: Arc::new(TemplateStorageRegistry::new()),
            fetcher: Arc::new(FileInclusionFetcher),
            events: events.clone(),
            servers: servers.clone(),
            stop_grace: Duration::from_millis(10),
        });
        let services = Arc::new(CloudServiceManager::new(
            ctx,
            dir.join("temp"),
            dir.join("static"),
        ));
        let publisher = SnapshotPublisher::new(
            servers,
            services.clone(),
            SnapshotPublisherConfig::default(),
        );
        (runner, events, publisher, services)
    }

    fn configuration(task: &str) -> ServiceConfiguration {
        ServiceConfiguration::builder()
            .task_name(task)
            .command("java")
            .auto_delete_on_stop(false)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_publishes_running_services_and_detects_exits() {
        let dir = tempfile::tempdir().unwrap();
        let (runner, events, publisher, services) = setup(dir.path());

        let first = services.create_service(configuration("Lobby")).await.unwrap();
        let second = services.create_service(configuration("Lobby")).await.unwrap();
        services.start_service(first.unique_id()).await.unwrap();
        services.start_service(second.unique_id()).await.unwrap();

        let updates = Arc::new(Mutex::new(0usize));
        let counter = updates.clone();
        events.register(EventKind::ServiceInfoUpdated, move |_, _| {
            *counter.lock().unwrap() += 1;
        });

        let round = publisher.publish_once().await;
        assert_eq!(round, PublishRound { exited: 0, service_snapshots: 2 });
        assert_eq!(*updates.lock().unwrap(), 2);

        let service = services.service(first.unique_id()).unwrap();
        let handle_id = service.lock().await.handle().unwrap().handle_id.clone();
        runner.exit(&handle_id, 0).await;

        let round = publisher.publish_once().await;
        assert_eq!(round.exited, 1);
        assert_eq!(round.service_snapshots, 1);
        assert_eq!(
            service.lock().await.lifecycle(),
            crate::lifecycle::ServiceLifeCycle::Stopped
        );
    }

    #[tokio::test]
    async fn test_publisher_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, publisher, _) = setup(dir.path());

        let shutdown = publisher.shutdown_handle();
        let task = tokio::spawn(async move { publisher.run().await });
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
