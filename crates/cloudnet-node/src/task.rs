// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster-wide configuration: service tasks, groups and storage configs.
//!
//! These are the categories reconciled between nodes by the data sync
//! registry. Tasks additionally propagate single changes through the
//! `add_service_task` / `remove_service_task` / `set_service_tasks` messages.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};

use cloudnet_protocol::{ChannelMessage, InternalMessage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cluster::NodeServerProvider;
use crate::events::{CloudEvent, EventManager};
use crate::service::{
    ServiceDeployment, ServiceEnvironmentType, ServiceRemoteInclusion, ServiceTemplate,
};

/// Values stored by name in a [`NamedRegistry`].
pub trait Named {
    fn name(&self) -> &str;
}

/// Blueprint describing how to configure and scale a class of services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceTask {
    pub name: String,
    pub runtime: String,
    pub environment: ServiceEnvironmentType,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub templates: Vec<ServiceTemplate>,
    pub inclusions: Vec<ServiceRemoteInclusion>,
    pub deployments: Vec<ServiceDeployment>,
    pub groups: Vec<String>,
    /// Nodes allowed to host services of this task. Empty allows all.
    pub associated_nodes: Vec<String>,
    pub min_service_count: u32,
    pub max_heap_memory_mb: u32,
    pub auto_delete_on_stop: bool,
    pub static_services: bool,
    pub maintenance: bool,
}

impl Default for ServiceTask {
    fn default() -> Self {
        Self {
            name: String::new(),
            runtime: "process".to_string(),
            environment: ServiceEnvironmentType::MinecraftServer,
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            templates: Vec::new(),
            inclusions: Vec::new(),
            deployments: Vec::new(),
            groups: Vec::new(),
            associated_nodes: Vec::new(),
            min_service_count: 0,
            max_heap_memory_mb: 512,
            auto_delete_on_stop: true,
            static_services: false,
            maintenance: false,
        }
    }
}

impl ServiceTask {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Self::default()
        }
    }
}

impl Named for ServiceTask {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Resources shared by every task in the group.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfiguration {
    pub name: String,
    pub templates: Vec<ServiceTemplate>,
    pub deployments: Vec<ServiceDeployment>,
    pub inclusions: Vec<ServiceRemoteInclusion>,
}

impl GroupConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Named for GroupConfiguration {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Declares a template storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub name: String,
    /// Backend kind, e.g. `local`.
    pub kind: String,
    pub base_path: String,
}

impl Named for StorageConfig {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Thread-safe map of values by name, kept sorted.
#[derive(Debug)]
pub struct NamedRegistry<T> {
    entries: RwLock<BTreeMap<String, T>>,
}

impl<T> Default for NamedRegistry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: Named + Clone> NamedRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns the previous value.
    pub fn put(&self, value: T) -> Option<T> {
        self.write().insert(value.name().to_string(), value)
    }

    pub fn remove(&self, name: &str) -> Option<T> {
        self.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<T> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn all(&self) -> Vec<T> {
        self.read().values().cloned().collect()
    }

    /// Replace the whole content. Returns the previous values.
    pub fn replace_all(&self, values: Vec<T>) -> Vec<T> {
        let next: BTreeMap<String, T> = values
            .into_iter()
            .map(|value| (value.name().to_string(), value))
            .collect();
        std::mem::replace(&mut *self.write(), next)
            .into_values()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, T>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, T>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Service tasks known to this node.
///
/// The plain operations apply locally and broadcast the change; the
/// `_silently` variants only apply locally and are used for changes that
/// arrived from a peer.
pub struct ServiceTaskProvider {
    tasks: NamedRegistry<ServiceTask>,
    servers: Arc<NodeServerProvider>,
    events: Arc<EventManager>,
}

impl ServiceTaskProvider {
    pub fn new(servers: Arc<NodeServerProvider>, events: Arc<EventManager>) -> Self {
        Self {
            tasks: NamedRegistry::new(),
            servers,
            events,
        }
    }

    pub fn tasks(&self) -> Vec<ServiceTask> {
        self.tasks.all()
    }

    pub fn task(&self, name: &str) -> Option<ServiceTask> {
        self.tasks.get(name)
    }

    pub fn add_task(&self, task: ServiceTask) {
        self.broadcast(InternalMessage::AddServiceTask, &task);
        self.add_task_silently(task);
    }

    pub fn add_task_silently(&self, task: ServiceTask) {
        debug!(task = %task.name, "Adding service task");
        self.tasks.put(task.clone());
        self.events.publish(&CloudEvent::ServiceTaskAdded { task });
    }

    pub fn remove_task(&self, name: &str) -> Option<ServiceTask> {
        let task = self.remove_task_silently(name)?;
        self.broadcast(InternalMessage::RemoveServiceTask, &task);
        Some(task)
    }

    pub fn remove_task_silently(&self, name: &str) -> Option<ServiceTask> {
        let task = self.tasks.remove(name)?;
        debug!(task = %task.name, "Removed service task");
        self.events.publish(&CloudEvent::ServiceTaskRemoved { task: task.clone() });
        Some(task)
    }

    pub fn set_tasks(&self, tasks: Vec<ServiceTask>) {
        self.broadcast(InternalMessage::SetServiceTasks, &tasks);
        self.set_tasks_silently(tasks);
    }

    /// Replace every task. Raises removal events for dropped tasks and
    /// addition events for new or changed ones.
    pub fn set_tasks_silently(&self, tasks: Vec<ServiceTask>) {
        let previous = self.tasks.replace_all(tasks.clone());
        let names: HashSet<&str> = tasks.iter().map(|t| t.name.as_str()).collect();

        for task in previous.iter().filter(|t| !names.contains(t.name.as_str())) {
            self.events
                .publish(&CloudEvent::ServiceTaskRemoved { task: task.clone() });
        }
        for task in tasks {
            if !previous.contains(&task) {
                self.events.publish(&CloudEvent::ServiceTaskAdded { task });
            }
        }
    }

    fn broadcast<T: Serialize>(&self, kind: InternalMessage, value: &T) {
        match serde_json::to_vec(value) {
            Ok(content) => {
                self.servers
                    .broadcast(&ChannelMessage::internal(kind, content));
            }
            Err(e) => warn!(message = %kind, error = %e, "Failed to encode task change"),
        }
    }
}

impl std::fmt::Debug for ServiceTaskProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceTaskProvider")
            .field("tasks", &self.tasks.len())
            .finish()
    }
}
