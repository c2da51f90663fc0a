// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in sync handlers: tasks, groups and storage configs.

use std::sync::Arc;

use tracing::{info, warn};

use super::{DataSyncHandler, DataSyncRegistry, SyncError};
use crate::service::LOCAL_STORAGE;
use crate::task::{
    GroupConfiguration, NamedRegistry, ServiceTask, ServiceTaskProvider, StorageConfig,
};
use crate::template::{LocalTemplateStorage, TemplateStorageRegistry};

pub const TASK_CONFIG: &str = "task_config";
pub const GROUP_CONFIG: &str = "group_config";
pub const STORAGE_CONFIG: &str = "storage_config";

/// Storage kind backed by [`LocalTemplateStorage`].
pub const LOCAL_STORAGE_KIND: &str = "local";

pub fn task_config(
    tasks: Arc<ServiceTaskProvider>,
) -> Result<DataSyncHandler<ServiceTask>, SyncError> {
    let current = tasks.clone();
    let writer = tasks.clone();
    DataSyncHandler::builder()
        .key(TASK_CONFIG)
        .name_extractor(|task: &ServiceTask| task.name.clone())
        .current_getter(move |name| current.task(name))
        .writer(move |task| writer.add_task_silently(task))
        .data_collector(move || tasks.tasks())
        .build()
}

pub fn group_config(
    groups: Arc<NamedRegistry<GroupConfiguration>>,
) -> Result<DataSyncHandler<GroupConfiguration>, SyncError> {
    let current = groups.clone();
    let writer = groups.clone();
    DataSyncHandler::builder()
        .key(GROUP_CONFIG)
        .name_extractor(|group: &GroupConfiguration| group.name.clone())
        .current_getter(move |name| current.get(name))
        .writer(move |group| {
            writer.put(group);
        })
        .data_collector(move || groups.all())
        .build()
}

/// Storage configs. Local storages are registered as backends on write.
///
/// Backends the node registered itself, including its own `local` storage,
/// are never replaced by a synced config.
pub fn storage_config(
    configs: Arc<NamedRegistry<StorageConfig>>,
    storages: Arc<TemplateStorageRegistry>,
) -> Result<DataSyncHandler<StorageConfig>, SyncError> {
    let current = configs.clone();
    let writer = configs.clone();
    DataSyncHandler::builder()
        .key(STORAGE_CONFIG)
        .name_extractor(|config: &StorageConfig| config.name.clone())
        .current_getter(move |name| current.get(name))
        .writer(move |config: StorageConfig| {
            let synced_before = writer.contains(&config.name);
            if config.name == LOCAL_STORAGE
                || (!synced_before && storages.get(&config.name).is_some())
            {
                warn!(storage = %config.name, "Ignoring storage config for a node-owned storage");
                return;
            }
            if config.kind == LOCAL_STORAGE_KIND {
                storages.register(Arc::new(LocalTemplateStorage::new(
                    config.name.clone(),
                    config.base_path.clone(),
                )));
                info!(storage = %config.name, "Registered template storage");
            } else {
                warn!(storage = %config.name, kind = %config.kind, "Unsupported storage kind");
            }
            writer.put(config);
        })
        .data_collector(move || configs.all())
        .build()
}

/// Register the three built-in handlers.
pub fn register_defaults(
    registry: &DataSyncRegistry,
    tasks: Arc<ServiceTaskProvider>,
    groups: Arc<NamedRegistry<GroupConfiguration>>,
    storage_configs: Arc<NamedRegistry<StorageConfig>>,
    storages: Arc<TemplateStorageRegistry>,
) -> Result<(), SyncError> {
    registry.register(task_config(tasks)?)?;
    registry.register(group_config(groups)?)?;
    registry.register(storage_config(storage_configs, storages)?)?;
    Ok(())
}
