// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service identity.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of application a service runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceEnvironmentType {
    MinecraftServer,
    Proxy,
    Custom(String),
}

/// Identity of one managed service.
///
/// Immutable apart from the placement (`node_unique_id`, `task_service_id`),
/// which the hosting node fixes exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceId {
    unique_id: Uuid,
    task_name: String,
    task_service_id: u32,
    node_unique_id: String,
    allowed_nodes: Vec<String>,
    environment: ServiceEnvironmentType,
}

impl ServiceId {
    /// A fresh, not yet placed identity.
    pub fn new(
        task_name: impl Into<String>,
        node_unique_id: impl Into<String>,
        allowed_nodes: Vec<String>,
        environment: ServiceEnvironmentType,
    ) -> Self {
        Self {
            unique_id: Uuid::new_v4(),
            task_name: task_name.into(),
            task_service_id: 0,
            node_unique_id: node_unique_id.into(),
            allowed_nodes,
            environment,
        }
    }

    pub fn unique_id(&self) -> Uuid {
        self.unique_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Per-task index, `0` until placed.
    pub fn task_service_id(&self) -> u32 {
        self.task_service_id
    }

    pub fn node_unique_id(&self) -> &str {
        &self.node_unique_id
    }

    pub fn allowed_nodes(&self) -> &[String] {
        &self.allowed_nodes
    }

    pub fn environment(&self) -> &ServiceEnvironmentType {
        &self.environment
    }

    /// `<taskName>-<taskServiceId>`
    pub fn name(&self) -> String {
        format!("{}-{}", self.task_name, self.task_service_id)
    }

    pub fn is_placed(&self) -> bool {
        self.task_service_id > 0
    }

    /// Whether `node` may host this service. An empty allow-list permits every node.
    pub fn is_allowed_on(&self, node: &str) -> bool {
        self.allowed_nodes.is_empty() || self.allowed_nodes.iter().any(|n| n == node)
    }

    /// Fix the placement. Returns `None` when the identity was already placed.
    pub(crate) fn placed(&self, node_unique_id: &str, task_service_id: u32) -> Option<Self> {
        if self.is_placed() || task_service_id == 0 {
            return None;
        }
        Some(Self {
            node_unique_id: node_unique_id.to_string(),
            task_service_id,
            ..self.clone()
        })
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.task_name, self.task_service_id)
    }
}
