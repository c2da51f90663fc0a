// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fetching remote inclusions into a service working directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{Result, StorageError, resolve_relative};
use crate::service::ServiceRemoteInclusion;

/// Downloads one inclusion into a working directory.
#[async_trait]
pub trait InclusionFetcher: Send + Sync {
    /// Fetch `inclusion` to its destination below `working_dir`.
    async fn fetch(&self, inclusion: &ServiceRemoteInclusion, working_dir: &Path) -> Result<PathBuf>;
}

/// Fetcher for local paths and `file://` urls.
#[derive(Debug, Clone, Default)]
pub struct FileInclusionFetcher;

#[async_trait]
impl InclusionFetcher for FileInclusionFetcher {
    async fn fetch(&self, inclusion: &ServiceRemoteInclusion, working_dir: &Path) -> Result<PathBuf> {
        let source = match inclusion.url.split_once("://") {
            Some(("file", path)) => PathBuf::from(path),
            Some(_) => return Err(StorageError::UnsupportedUrl(inclusion.url.clone())),
            None => PathBuf::from(&inclusion.url),
        };
        let target = resolve_relative(working_dir, &inclusion.destination)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, &target).await?;

        debug!(url = %inclusion.url, target = %target.display(), "Fetched inclusion");
        Ok(target)
    }
}
