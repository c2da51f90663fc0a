// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task changes made on a peer, applied here without re-broadcasting.

use std::sync::Arc;

use cloudnet_protocol::ChannelMessage;

use super::decode;
use crate::task::{ServiceTask, ServiceTaskProvider};

pub struct TaskChannelMessageListener {
    tasks: Arc<ServiceTaskProvider>,
}

impl TaskChannelMessageListener {
    pub fn new(tasks: Arc<ServiceTaskProvider>) -> Self {
        Self { tasks }
    }

    pub fn set_service_tasks(&self, message: &ChannelMessage) {
        if let Some(tasks) = decode::<Vec<ServiceTask>>(message) {
            self.tasks.set_tasks_silently(tasks);
        }
    }

    pub fn add_service_task(&self, message: &ChannelMessage) {
        if let Some(task) = decode::<ServiceTask>(message) {
            self.tasks.add_task_silently(task);
        }
    }

    pub fn remove_service_task(&self, message: &ChannelMessage) {
        if let Some(task) = decode::<ServiceTask>(message) {
            self.tasks.remove_task_silently(&task.name);
        }
    }
}
