// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service configuration and the resources applied to a service.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::service::id::{ServiceEnvironmentType, ServiceId};
use crate::task::{GroupConfiguration, ServiceTask};

/// Name of the storage backed by the node's data directory.
pub const LOCAL_STORAGE: &str = "local";

/// A named bundle of files in a template storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceTemplate {
    pub prefix: String,
    pub name: String,
    pub storage: String,
}

impl ServiceTemplate {
    pub fn new(
        prefix: impl Into<String>,
        name: impl Into<String>,
        storage: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
            storage: storage.into(),
        }
    }

    /// Template in the [`LOCAL_STORAGE`].
    pub fn local(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(prefix, name, LOCAL_STORAGE)
    }

    /// `prefix/name`, the storage-relative path of the template.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.prefix, self.name)
    }
}

impl fmt::Display for ServiceTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.storage, self.prefix, self.name)
    }
}

/// A file fetched into the working directory before the service starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceRemoteInclusion {
    pub url: String,
    /// Path relative to the working directory.
    pub destination: String,
}

impl ServiceRemoteInclusion {
    pub fn new(url: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
        }
    }
}

/// Working-directory files pushed back into a template when the service stops.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDeployment {
    pub template: ServiceTemplate,
    /// Relative paths (files or directories) that are not deployed.
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl ServiceDeployment {
    pub fn new(template: ServiceTemplate, excludes: Vec<String>) -> Self {
        Self { template, excludes }
    }

    /// Whether the `/`-separated relative `path` is excluded.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excludes.iter().any(|exclude| {
            let exclude = exclude.trim_matches('/');
            !exclude.is_empty()
                && (path == exclude
                    || path
                        .strip_prefix(exclude)
                        .is_some_and(|rest| rest.starts_with('/')))
        })
    }
}

/// Everything needed to create and run a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfiguration {
    pub service_id: ServiceId,
    pub runtime: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub auto_delete_on_stop: bool,
    pub static_service: bool,
    pub groups: Vec<String>,
    pub templates: Vec<ServiceTemplate>,
    pub inclusions: Vec<ServiceRemoteInclusion>,
    pub deployments: Vec<ServiceDeployment>,
    pub max_heap_memory_mb: u32,
}

impl ServiceConfiguration {
    pub fn builder() -> ServiceConfigurationBuilder {
        ServiceConfigurationBuilder::default()
    }
}

/// Builder for [`ServiceConfiguration`]. Required: task name and command.
#[derive(Debug, Clone)]
pub struct ServiceConfigurationBuilder {
    task_name: Option<String>,
    node_unique_id: String,
    allowed_nodes: Vec<String>,
    environment: ServiceEnvironmentType,
    runtime: String,
    command: Option<String>,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    auto_delete_on_stop: bool,
    static_service: bool,
    groups: Vec<String>,
    templates: Vec<ServiceTemplate>,
    inclusions: Vec<ServiceRemoteInclusion>,
    deployments: Vec<ServiceDeployment>,
    max_heap_memory_mb: u32,
}

impl Default for ServiceConfigurationBuilder {
    fn default() -> Self {
        Self {
            task_name: None,
            node_unique_id: String::new(),
            allowed_nodes: Vec::new(),
            environment: ServiceEnvironmentType::MinecraftServer,
            runtime: "process".to_string(),
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            auto_delete_on_stop: true,
            static_service: false,
            groups: Vec::new(),
            templates: Vec::new(),
            inclusions: Vec::new(),
            deployments: Vec::new(),
            max_heap_memory_mb: 512,
        }
    }
}

impl ServiceConfigurationBuilder {
    /// Prefill from a task and the groups it belongs to.
    ///
    /// Group resources come first so task templates can override group files.
    pub fn from_task(task: &ServiceTask, groups: &[GroupConfiguration]) -> Self {
        let mut builder = Self {
            task_name: Some(task.name.clone()),
            allowed_nodes: task.associated_nodes.clone(),
            environment: task.environment.clone(),
            runtime: task.runtime.clone(),
            command: Some(task.command.clone()),
            args: task.args.clone(),
            env: task.env.clone(),
            auto_delete_on_stop: task.auto_delete_on_stop,
            static_service: task.static_services,
            groups: task.groups.clone(),
            max_heap_memory_mb: task.max_heap_memory_mb,
            ..Self::default()
        };

        for group in groups.iter().filter(|g| task.groups.contains(&g.name)) {
            builder.templates.extend(group.templates.iter().cloned());
            builder.inclusions.extend(group.inclusions.iter().cloned());
            builder.deployments.extend(group.deployments.iter().cloned());
        }
        builder.templates.extend(task.templates.iter().cloned());
        builder.inclusions.extend(task.inclusions.iter().cloned());
        builder.deployments.extend(task.deployments.iter().cloned());
        builder
    }

    pub fn task_name(mut self, name: impl Into<String>) -> Self {
        self.task_name = Some(name.into());
        self
    }

    pub fn node(mut self, node_unique_id: impl Into<String>) -> Self {
        self.node_unique_id = node_unique_id.into();
        self
    }

    pub fn allowed_nodes(mut self, nodes: Vec<String>) -> Self {
        self.allowed_nodes = nodes;
        self
    }

    pub fn environment(mut self, environment: ServiceEnvironmentType) -> Self {
        self.environment = environment;
        self
    }

    pub fn runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    pub fn command(mut self, program: impl Into<String>) -> Self {
        self.command = Some(program.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn auto_delete_on_stop(mut self, auto_delete: bool) -> Self {
        self.auto_delete_on_stop = auto_delete;
        self
    }

    pub fn static_service(mut self, static_service: bool) -> Self {
        self.static_service = static_service;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn template(mut self, template: ServiceTemplate) -> Self {
        self.templates.push(template);
        self
    }

    pub fn inclusion(mut self, inclusion: ServiceRemoteInclusion) -> Self {
        self.inclusions.push(inclusion);
        self
    }

    pub fn deployment(mut self, deployment: ServiceDeployment) -> Self {
        self.deployments.push(deployment);
        self
    }

    pub fn max_heap_memory_mb(mut self, megabytes: u32) -> Self {
        self.max_heap_memory_mb = megabytes;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<ServiceConfiguration> {
        let task_name = self
            .task_name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| Error::InvalidConfiguration("task name is required".to_string()))?;
        if task_name.contains(['/', '\\']) {
            return Err(Error::InvalidConfiguration(format!(
                "task name {} must not contain path separators",
                task_name
            )));
        }
        let command = self
            .command
            .filter(|command| !command.trim().is_empty())
            .ok_or_else(|| Error::InvalidConfiguration("command is required".to_string()))?;
        if self.max_heap_memory_mb == 0 {
            return Err(Error::InvalidConfiguration(
                "max heap memory must be positive".to_string(),
            ));
        }

        Ok(ServiceConfiguration {
            service_id: ServiceId::new(
                task_name,
                self.node_unique_id,
                self.allowed_nodes,
                self.environment,
            ),
            runtime: self.runtime,
            command,
            args: self.args,
            env: self.env,
            auto_delete_on_stop: self.auto_delete_on_stop,
            static_service: self.static_service,
            groups: self.groups,
            templates: self.templates,
            inclusions: self.inclusions,
            deployments: self.deployments,
            max_heap_memory_mb: self.max_heap_memory_mb,
        })
    }
}
