// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Point-in-time service status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::ServiceLifeCycle;
use crate::service::ServiceId;

/// Immutable status record of one service, broadcast to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfoSnapshot {
    pub service_id: ServiceId,
    pub lifecycle: ServiceLifeCycle,
    /// Whether the process connected back to its node.
    pub connected: bool,
    pub process_id: Option<u32>,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
    /// When the service was created.
    pub creation_time: DateTime<Utc>,
    /// Increases with every snapshot of the same service.
    pub sequence: u64,
}

impl ServiceInfoSnapshot {
    pub fn name(&self) -> String {
        self.service_id.name()
    }
}
