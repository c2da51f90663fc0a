// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation of shared configuration between nodes.
//!
//! A [`DataSyncRegistry`] holds one [`DataSyncHandler`] per category. One
//! `sync_cluster_data` exchange applies the sender's items on the receiver
//! and answers with the receiver's items the sender did not mention:
//!
//! ```text
//!   node A                                   node B
//!   prepare_payload() ── sync_cluster_data ──▶ handle(payload, force)
//!                                               ├─ apply accepted items
//!   handle(response) ◀──── backfill ──────────┘
//! ```
//!
//! Conflicts resolve as last applier wins; `force` overwrites regardless of
//! equality.

pub mod defaults;
mod handler;
mod registry;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use handler::{DataSyncHandler, DataSyncHandlerBuilder};
pub use registry::DataSyncRegistry;

/// Errors from data sync.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    #[error("Sync handler is missing {0}")]
    MissingField(&'static str),

    #[error("Sync handler {0} is already registered")]
    DuplicateKey(String),

    #[error("Invalid sync payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Items of one handler key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntry {
    pub key: String,
    #[serde(default)]
    pub items: Vec<Value>,
}

/// Sequence of `(key, items)` pairs shipped between nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    #[serde(default)]
    pub entries: Vec<SyncEntry>,
}

impl SyncPayload {
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|entry| entry.items.is_empty())
    }

    pub fn entry(&self, key: &str) -> Option<&SyncEntry> {
        self.entries.iter().find(|entry| entry.key == key)
    }
}

/// Content of a `sync_cluster_data` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub force: bool,
    pub payload: SyncPayload,
}
