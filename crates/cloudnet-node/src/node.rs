// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wiring of one node's components.
//!
//! Components are built in dependency order: events, node servers, cluster
//! membership, tasks and storages, data sync, services and finally the
//! channel listeners. Everything is passed explicitly; there is no global
//! node instance.

use std::sync::Arc;
use std::time::Duration;

use cloudnet_protocol::{InboundHandler, NetworkChannel};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cluster::connector::request_initial_cluster_data;
use crate::cluster::{
    ClusterNodeProvider, CommandExecutor, LocalNodeServer, NetworkClusterNode, NodeServerProvider,
    RemoteNodeServer,
};
use crate::config::NodeConfig;
use crate::error::Result;
use crate::events::{CloudEvent, EventKind, EventManager};
use crate::listener::{
    ChannelMessageDispatcher, NodeChannelMessageListener, ServiceChannelMessageListener,
    TaskChannelMessageListener,
};
use crate::runner::Runner;
use crate::service::{CloudServiceManager, LOCAL_STORAGE, ServiceContext};
use crate::sync::DataSyncRegistry;
use crate::sync::defaults::register_defaults;
use crate::task::{GroupConfiguration, NamedRegistry, ServiceTaskProvider, StorageConfig};
use crate::template::{InclusionFetcher, LocalTemplateStorage, TemplateStorageRegistry};

/// Time a service process gets to exit after SIGTERM.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Every component of a running node.
pub struct NodeContext {
    config: NodeConfig,
    events: Arc<EventManager>,
    servers: Arc<NodeServerProvider>,
    nodes: Arc<ClusterNodeProvider>,
    tasks: Arc<ServiceTaskProvider>,
    groups: Arc<NamedRegistry<GroupConfiguration>>,
    storage_configs: Arc<NamedRegistry<StorageConfig>>,
    storages: Arc<TemplateStorageRegistry>,
    sync: Arc<DataSyncRegistry>,
    services: Arc<CloudServiceManager>,
    dispatcher: Arc<ChannelMessageDispatcher>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl NodeContext {
    pub fn new(
        config: NodeConfig,
        runner: Arc<dyn Runner>,
        executor: Arc<dyn CommandExecutor>,
        fetcher: Arc<dyn InclusionFetcher>,
    ) -> Result<Self> {
        let events = Arc::new(EventManager::new());

        let local = LocalNodeServer::new(
            NetworkClusterNode::new(config.node_id.clone(), vec![config.listen_addr]),
            config.max_memory_mb,
            executor,
            events.clone(),
        );
        let servers = Arc::new(NodeServerProvider::new(
            local,
            events.clone(),
            config.query_timeout,
        ));

        let nodes = Arc::new(ClusterNodeProvider::new(servers.clone(), events.clone()));
        for node in &config.cluster_nodes {
            if !nodes.add_node_silently(node.clone()) {
                debug!(node_id = %node.unique_id, "Skipping configured cluster node");
            }
        }

        let tasks = Arc::new(ServiceTaskProvider::new(servers.clone(), events.clone()));
        let groups = Arc::new(NamedRegistry::new());
        let storage_configs = Arc::new(NamedRegistry::new());
        let storages = Arc::new(TemplateStorageRegistry::new());
        storages.register(Arc::new(LocalTemplateStorage::new(
            LOCAL_STORAGE,
            config.local_templates_dir(),
        )));

        let sync = Arc::new(DataSyncRegistry::new());
        register_defaults(
            &sync,
            tasks.clone(),
            groups.clone(),
            storage_configs.clone(),
            storages.clone(),
        )?;

        let service_context = Arc::new(ServiceContext {
            runner,
            storages: storages.clone(),
            fetcher,
            events: events.clone(),
            servers: servers.clone(),
            stop_grace: DEFAULT_STOP_GRACE,
        });
        let services = Arc::new(CloudServiceManager::new(
            service_context,
            config.temp_services_dir(),
            config.static_services_dir(),
        ));

        for kind in [EventKind::ClusterNodeRemoved, EventKind::NodeDisconnected] {
            let services = Arc::downgrade(&services);
            events.register(kind, move |event, _| {
                let node_id = match event {
                    CloudEvent::ClusterNodeRemoved { node } => node.unique_id.as_str(),
                    CloudEvent::NodeDisconnected { unique_id } => unique_id.as_str(),
                    _ => return,
                };
                if let Some(services) = services.upgrade() {
                    services.remove_remote_snapshots_of(node_id);
                }
            });
        }

        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);

        let dispatcher = Arc::new(ChannelMessageDispatcher::new(
            events.clone(),
            NodeChannelMessageListener::new(
                servers.clone(),
                nodes.clone(),
                sync.clone(),
                config.force_initial_cluster_data_sync,
                shutdown.clone(),
            ),
            TaskChannelMessageListener::new(tasks.clone()),
            ServiceChannelMessageListener::new(services.clone()),
        ));

        info!(
            node_id = %config.node_id,
            cluster_nodes = config.cluster_nodes.len(),
            "Node initialized"
        );

        Ok(Self {
            config,
            events,
            servers,
            nodes,
            tasks,
            groups,
            storage_configs,
            storages,
            sync,
            services,
            dispatcher,
            shutdown,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn unique_id(&self) -> &str {
        self.servers.local().unique_id()
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn servers(&self) -> &Arc<NodeServerProvider> {
        &self.servers
    }

    pub fn nodes(&self) -> &Arc<ClusterNodeProvider> {
        &self.nodes
    }

    pub fn tasks(&self) -> &Arc<ServiceTaskProvider> {
        &self.tasks
    }

    pub fn groups(&self) -> &Arc<NamedRegistry<GroupConfiguration>> {
        &self.groups
    }

    pub fn storage_configs(&self) -> &Arc<NamedRegistry<StorageConfig>> {
        &self.storage_configs
    }

    pub fn storages(&self) -> &Arc<TemplateStorageRegistry> {
        &self.storages
    }

    pub fn sync(&self) -> &Arc<DataSyncRegistry> {
        &self.sync
    }

    pub fn services(&self) -> &Arc<CloudServiceManager> {
        &self.services
    }

    pub fn dispatcher(&self) -> &Arc<ChannelMessageDispatcher> {
        &self.dispatcher
    }

    /// Handler for every channel this node opens or accepts.
    pub fn inbound_handler(&self) -> InboundHandler {
        self.dispatcher.inbound_handler()
    }

    /// Bind a channel a peer opened to us.
    pub fn attach_channel(&self, channel: NetworkChannel) -> Result<Arc<RemoteNodeServer>> {
        self.servers.attach_channel(channel)
    }

    /// Bind a channel we opened and ask the peer for its cluster data.
    pub fn connect_channel(&self, channel: NetworkChannel) -> Result<Arc<RemoteNodeServer>> {
        let remote = self.servers.attach_channel(channel.clone())?;
        request_initial_cluster_data(&channel, self.unique_id());
        Ok(remote)
    }

    /// Push all local cluster data to every connected peer.
    pub fn sync_cluster_data(&self, force: bool) -> Result<usize> {
        self.sync.broadcast(&self.servers, force)
    }

    /// Ask whoever observes [`NodeContext::shutdown_requested`] to stop the node.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_requested(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.config.node_id)
            .field("servers", &self.servers.nodes().len())
            .field("services", &self.services)
            .finish()
    }
}
