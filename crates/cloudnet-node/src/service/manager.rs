// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of local services and the latest snapshots of remote ones.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cloud_service::{CloudService, ServiceContext};
use super::{ServiceConfiguration, ServiceId, ServiceInfoSnapshot};
use crate::error::{Error, Result};
use crate::events::CloudEvent;
use crate::lifecycle::ServiceLifeCycle;

struct ServiceEntry {
    id: ServiceId,
    service: Arc<Mutex<CloudService>>,
}

/// Owns every service placed on this node.
///
/// The registry lock is only held to look entries up; lifecycle operations
/// run under the per-service mutex.
pub struct CloudServiceManager {
    ctx: Arc<ServiceContext>,
    temp_dir: PathBuf,
    static_dir: PathBuf,
    services: RwLock<HashMap<Uuid, ServiceEntry>>,
    remote_snapshots: RwLock<HashMap<Uuid, ServiceInfoSnapshot>>,
}

impl CloudServiceManager {
    pub fn new(ctx: Arc<ServiceContext>, temp_dir: PathBuf, static_dir: PathBuf) -> Self {
        Self {
            ctx,
            temp_dir,
            static_dir,
            services: RwLock::new(HashMap::new()),
            remote_snapshots: RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    /// Place a new service on this node in state `PREPARED`.
    ///
    /// Rejected while the node drains or when the node is not in the
    /// service's allow-list. The task index is the lowest one not used by a
    /// local or known remote service of the same task.
    pub async fn create_service(&self, configuration: ServiceConfiguration) -> Result<ServiceId> {
        let local = self.ctx.servers.local();
        if local.is_draining() {
            return Err(Error::Draining(local.unique_id().to_string()));
        }
        let task_name = configuration.service_id.task_name().to_string();
        if !configuration.service_id.is_allowed_on(local.unique_id()) {
            return Err(Error::NodeNotAllowed {
                service: task_name,
                node: local.unique_id().to_string(),
            });
        }

        let (id, service) = {
            let mut services = self.write();
            let mut used: BTreeSet<u32> = services
                .values()
                .filter(|entry| entry.id.task_name() == task_name)
                .map(|entry| entry.id.task_service_id())
                .collect();
            used.extend(
                self.read_remote()
                    .values()
                    .filter(|snapshot| snapshot.service_id.task_name() == task_name)
                    .map(|snapshot| snapshot.service_id.task_service_id()),
            );
            let index = (1..)
                .find(|index| !used.contains(index))
                .unwrap_or(u32::MAX);

            let id = configuration
                .service_id
                .placed(local.unique_id(), index)
                .ok_or_else(|| {
                    Error::InvalidConfiguration(format!(
                        "service {} is already placed",
                        configuration.service_id
                    ))
                })?;

            let working_dir = if configuration.static_service {
                self.static_dir.join(id.name())
            } else {
                self.temp_dir
                    .join(format!("{}_{}", id.name(), id.unique_id().simple()))
            };
            let configuration = ServiceConfiguration {
                service_id: id.clone(),
                ..configuration
            };
            let service = Arc::new(Mutex::new(CloudService::new(configuration, working_dir)));
            services.insert(
                id.unique_id(),
                ServiceEntry {
                    id: id.clone(),
                    service: service.clone(),
                },
            );
            (id, service)
        };

        info!(service = %id, node_id = %local.unique_id(), "Service created");
        service.lock().await.publish_service_info_snapshot(&self.ctx);
        Ok(id)
    }

    pub fn service(&self, unique_id: Uuid) -> Option<Arc<Mutex<CloudService>>> {
        self.read()
            .get(&unique_id)
            .map(|entry| entry.service.clone())
    }

    pub fn service_by_name(&self, name: &str) -> Option<Arc<Mutex<CloudService>>> {
        self.read()
            .values()
            .find(|entry| entry.id.name() == name)
            .map(|entry| entry.service.clone())
    }

    /// Identities of every local service, sorted by name.
    pub fn service_ids(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.read().values().map(|entry| entry.id.clone()).collect();
        ids.sort_by(|a, b| {
            (a.task_name(), a.task_service_id()).cmp(&(b.task_name(), b.task_service_id()))
        });
        ids
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub async fn start_service(&self, unique_id: Uuid) -> Result<()> {
        let service = self.require(unique_id)?;
        let mut service = service.lock().await;
        service.start(&self.ctx).await
    }

    /// Stop a service. Services configured to auto-delete continue to
    /// `DELETED` and leave the registry.
    pub async fn stop_service(&self, unique_id: Uuid) -> Result<()> {
        let service = self.require(unique_id)?;
        let mut service = service.lock().await;
        service.stop(&self.ctx).await?;

        if service.configuration().auto_delete_on_stop {
            service.delete(&self.ctx).await?;
            self.remove(unique_id);
        }
        Ok(())
    }

    /// Stop (when running), prepare and start again, keeping the service.
    pub async fn restart_service(&self, unique_id: Uuid) -> Result<()> {
        let service = self.require(unique_id)?;
        let mut service = service.lock().await;
        if service.lifecycle() == ServiceLifeCycle::Running {
            service.stop(&self.ctx).await?;
        }
        if service.lifecycle() == ServiceLifeCycle::Stopped {
            service.prepare(&self.ctx).await?;
        }
        service.start(&self.ctx).await
    }

    pub async fn prepare_service(&self, unique_id: Uuid) -> Result<()> {
        let service = self.require(unique_id)?;
        let mut service = service.lock().await;
        service.prepare(&self.ctx).await
    }

    /// Delete a service. It is unreachable by lookup afterwards.
    pub async fn delete_service(&self, unique_id: Uuid) -> Result<()> {
        let service = self.require(unique_id)?;
        let mut service = service.lock().await;
        service.delete(&self.ctx).await?;
        self.remove(unique_id);
        Ok(())
    }

    /// Delete every local service, logging failures.
    pub async fn delete_all(&self) -> usize {
        let mut deleted = 0;
        for id in self.service_ids() {
            match self.delete_service(id.unique_id()).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(service = %id, error = %e, "Failed to delete service"),
            }
        }
        deleted
    }

    /// Move services whose process exited on its own to `STOPPED`, deleting
    /// auto-delete ones. Returns how many exited.
    pub async fn check_processes(&self) -> usize {
        let mut exited = 0;
        for id in self.service_ids() {
            let Some(service) = self.service(id.unique_id()) else {
                continue;
            };
            let mut service = service.lock().await;
            if !service.handle_process_exit(&self.ctx).await {
                continue;
            }
            exited += 1;
            if service.configuration().auto_delete_on_stop {
                match service.delete(&self.ctx).await {
                    Ok(()) => self.remove(id.unique_id()),
                    Err(e) => warn!(service = %id, error = %e, "Failed to delete exited service"),
                }
            }
        }
        exited
    }

    /// Publish a fresh snapshot of every `RUNNING` service.
    pub async fn publish_running_snapshots(&self) -> usize {
        let mut published = 0;
        for id in self.service_ids() {
            let Some(service) = self.service(id.unique_id()) else {
                continue;
            };
            let mut service = service.lock().await;
            if service.lifecycle() == ServiceLifeCycle::Running {
                service.publish_service_info_snapshot(&self.ctx);
                published += 1;
            }
        }
        published
    }

    /// Last snapshot of every local service.
    pub async fn local_snapshots(&self) -> Vec<ServiceInfoSnapshot> {
        let mut snapshots = Vec::new();
        for id in self.service_ids() {
            if let Some(service) = self.service(id.unique_id()) {
                snapshots.push(service.lock().await.last_snapshot().clone());
            }
        }
        snapshots
    }

    pub async fn count_in(&self, lifecycle: ServiceLifeCycle) -> usize {
        let mut count = 0;
        for id in self.service_ids() {
            if let Some(service) = self.service(id.unique_id())
                && service.lock().await.lifecycle() == lifecycle
            {
                count += 1;
            }
        }
        count
    }

    /// Apply a snapshot of a service hosted elsewhere.
    ///
    /// Only strictly newer snapshots replace the stored one; `DELETED`
    /// snapshots remove the entry.
    pub fn update_remote_snapshot(&self, snapshot: ServiceInfoSnapshot) -> bool {
        if snapshot.service_id.node_unique_id() == self.ctx.servers.local().unique_id() {
            return false;
        }
        let unique_id = snapshot.service_id.unique_id();
        {
            let mut remote = self
                .remote_snapshots
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(existing) = remote.get(&unique_id)
                && existing.sequence >= snapshot.sequence
            {
                debug!(service = %snapshot.service_id, "Stale service snapshot dropped");
                return false;
            }
            if snapshot.lifecycle == ServiceLifeCycle::Deleted {
                remote.remove(&unique_id);
            } else {
                remote.insert(unique_id, snapshot.clone());
            }
        }
        self.ctx
            .events
            .publish(&CloudEvent::ServiceInfoUpdated { snapshot });
        true
    }

    /// Forget every snapshot published by `node_unique_id`. Returns how many
    /// were dropped.
    pub fn remove_remote_snapshots_of(&self, node_unique_id: &str) -> usize {
        let mut remote = self
            .remote_snapshots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = remote.len();
        remote.retain(|_, snapshot| snapshot.service_id.node_unique_id() != node_unique_id);
        let dropped = before - remote.len();
        if dropped > 0 {
            debug!(node_id = %node_unique_id, dropped, "Remote service snapshots dropped");
        }
        dropped
    }

    pub fn remote_snapshots(&self) -> Vec<ServiceInfoSnapshot> {
        self.read_remote().values().cloned().collect()
    }

    fn require(&self, unique_id: Uuid) -> Result<Arc<Mutex<CloudService>>> {
        self.service(unique_id)
            .ok_or_else(|| Error::ServiceNotFound(unique_id.to_string()))
    }

    fn remove(&self, unique_id: Uuid) {
        if let Some(entry) = self.write().remove(&unique_id) {
            debug!(service = %entry.id, "Service removed");
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, ServiceEntry>> {
        self.services
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, ServiceEntry>> {
        self.services
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_remote(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, ServiceInfoSnapshot>> {
        self.remote_snapshots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for CloudServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudServiceManager")
            .field("services", &self.count())
            .field("remote_services", &self.read_remote().len())
            .finish()
    }
}
