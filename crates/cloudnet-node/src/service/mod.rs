// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Services: identity, configuration, snapshots and their lifecycle manager.

pub mod cloud_service;
pub mod configuration;
pub mod id;
pub mod manager;
pub mod snapshot;

pub use cloud_service::{CloudService, ServiceContext};
pub use configuration::{
    LOCAL_STORAGE, ServiceConfiguration, ServiceConfigurationBuilder, ServiceDeployment,
    ServiceRemoteInclusion, ServiceTemplate,
};
pub use id::{ServiceEnvironmentType, ServiceId};
pub use manager::CloudServiceManager;
pub use snapshot::ServiceInfoSnapshot;
