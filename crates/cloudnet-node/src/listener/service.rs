// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use cloudnet_protocol::ChannelMessage;

use super::decode;
use crate::service::{CloudServiceManager, ServiceInfoSnapshot};

/// Keeps the view of services hosted on peers current.
pub struct ServiceChannelMessageListener {
    services: Arc<CloudServiceManager>,
}

impl ServiceChannelMessageListener {
    pub fn new(services: Arc<CloudServiceManager>) -> Self {
        Self { services }
    }

    pub fn update_service_info(&self, message: &ChannelMessage) {
        if let Some(snapshot) = decode::<ServiceInfoSnapshot>(message) {
            self.services.update_remote_snapshot(snapshot);
        }
    }
}
