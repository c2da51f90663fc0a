// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of sync handlers and the `sync_cluster_data` exchange.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use cloudnet_protocol::{ChannelMessage, InternalMessage, NetworkChannel};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::handler::ErasedSyncHandler;
use super::{DataSyncHandler, SyncEntry, SyncError, SyncPayload, SyncRequest};
use crate::cluster::NodeServerProvider;
use crate::error::Result;

struct RegisteredHandler {
    handler: Box<dyn ErasedSyncHandler>,
    // serializes reconciliation of one key
    lock: Mutex<()>,
}

impl RegisteredHandler {
    fn handle(&self, incoming: Option<&[serde_json::Value]>, force: bool) -> Vec<serde_json::Value> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.handler.handle(incoming, force)
    }
}

/// Sync handlers by key.
#[derive(Default)]
pub struct DataSyncRegistry {
    handlers: RwLock<BTreeMap<String, Arc<RegisteredHandler>>>,
}

impl DataSyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Keys are unique.
    pub fn register<T>(&self, handler: DataSyncHandler<T>) -> std::result::Result<(), SyncError>
    where
        T: Serialize + DeserializeOwned + PartialEq + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let key = handler.key().to_string();
        if handlers.contains_key(&key) {
            return Err(SyncError::DuplicateKey(key));
        }
        handlers.insert(
            key,
            Arc::new(RegisteredHandler {
                handler: Box::new(handler),
                lock: Mutex::new(()),
            }),
        );
        Ok(())
    }

    pub fn unregister(&self, key: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key)
            .is_some()
    }

    pub fn has_handler(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Apply an incoming payload and compute what the sender is missing.
    ///
    /// Unknown keys are skipped. Returns `None` when there is nothing to
    /// send back.
    pub fn handle(&self, payload: &SyncPayload, force: bool) -> Option<SyncPayload> {
        let handlers: Vec<Arc<RegisteredHandler>> = self.read().values().cloned().collect();

        for entry in &payload.entries {
            if !self.has_handler(&entry.key) {
                debug!(key = %entry.key, "Skipping sync entry without handler");
            }
        }

        let entries: Vec<SyncEntry> = handlers
            .iter()
            .map(|registered| {
                let key = registered.handler.key();
                let incoming = payload.entry(key).map(|entry| entry.items.as_slice());
                SyncEntry {
                    key: key.to_string(),
                    items: registered.handle(incoming, force),
                }
            })
            .filter(|entry| !entry.items.is_empty())
            .collect();

        if entries.is_empty() {
            None
        } else {
            Some(SyncPayload { entries })
        }
    }

    /// Every local item of every handler.
    pub fn prepare_payload(&self) -> SyncPayload {
        let entries = self
            .read()
            .values()
            .map(|registered| SyncEntry {
                key: registered.handler.key().to_string(),
                items: registered.handler.collect(),
            })
            .collect();
        SyncPayload { entries }
    }

    /// `sync_cluster_data` message carrying the full local data set.
    pub fn prepare_message(&self, force: bool) -> Result<ChannelMessage> {
        let request = SyncRequest {
            force,
            payload: self.prepare_payload(),
        };
        Ok(ChannelMessage::internal(
            InternalMessage::SyncClusterData,
            serde_json::to_vec(&request)?,
        ))
    }

    /// Push the local data set to one peer as a query and apply the items it
    /// answers with. The answer is applied without computing a further reply.
    pub async fn sync_with(
        &self,
        channel: &NetworkChannel,
        local_id: &str,
        force: bool,
        timeout: Duration,
    ) -> Result<()> {
        let message = self.prepare_message(force)?.with_sender(local_id);
        let response = channel.send_query(&message, timeout).await?;

        if let Some(bytes) = response {
            let payload: SyncPayload = serde_json::from_slice(&bytes).map_err(SyncError::from)?;
            debug!(peer = %channel.peer(), entries = payload.entries.len(), "Applying sync backfill");
            self.handle(&payload, force);
        }
        Ok(())
    }

    /// Send the local data set to every connected peer without waiting.
    pub fn broadcast(&self, servers: &NodeServerProvider, force: bool) -> Result<usize> {
        Ok(servers.broadcast(&self.prepare_message(force)?))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<RegisteredHandler>>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for DataSyncRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSyncRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}
