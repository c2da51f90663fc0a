// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Template storages and the file operations services need from them.
//!
//! A storage holds templates (`prefix/name` directories of files). Services
//! copy templates into their working directory before start and deploy files
//! back into templates when they stop.

pub mod inclusion;
pub mod local;

use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::service::{ServiceDeployment, ServiceTemplate};

pub use inclusion::{FileInclusionFetcher, InclusionFetcher};
pub use local::LocalTemplateStorage;

/// Errors from template storage operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("Unknown template storage: {0}")]
    UnknownStorage(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Invalid path {0}: must be relative and stay inside the template")]
    InvalidPath(String),

    #[error("Unsupported inclusion url: {0}")]
    UnsupportedUrl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

pub type StorageReader = Box<dyn AsyncRead + Send + Unpin>;
pub type StorageWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Metadata of a file or directory inside a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Path relative to the template root, `/`-separated.
    pub path: String,
    pub name: String,
    pub directory: bool,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Uniform interface over template storage backends.
///
/// Paths are relative to the template root and use `/` as separator.
#[async_trait]
pub trait TemplateStorage: Send + Sync {
    /// Storage name referenced by [`ServiceTemplate::storage`].
    fn name(&self) -> &str;

    /// Create an empty template. `false` if it already existed.
    async fn create(&self, template: &ServiceTemplate) -> Result<bool>;

    async fn has(&self, template: &ServiceTemplate) -> bool;

    /// Delete a template with all its files. `false` if it did not exist.
    async fn delete(&self, template: &ServiceTemplate) -> Result<bool>;

    /// Truncating writer, creating parent directories as needed.
    async fn new_output_stream(
        &self,
        template: &ServiceTemplate,
        path: &str,
    ) -> Result<StorageWriter>;

    /// Appending writer, creating the file if needed.
    async fn append_output_stream(
        &self,
        template: &ServiceTemplate,
        path: &str,
    ) -> Result<StorageWriter>;

    /// Reader for a file, `None` if it does not exist.
    async fn new_input_stream(
        &self,
        template: &ServiceTemplate,
        path: &str,
    ) -> Result<Option<StorageReader>>;

    /// Create an empty file. `false` if it already existed.
    async fn create_file(&self, template: &ServiceTemplate, path: &str) -> Result<bool>;

    async fn create_directory(&self, template: &ServiceTemplate, path: &str) -> Result<bool>;

    async fn has_file(&self, template: &ServiceTemplate, path: &str) -> Result<bool>;

    async fn delete_file(&self, template: &ServiceTemplate, path: &str) -> Result<bool>;

    async fn file_info(&self, template: &ServiceTemplate, path: &str) -> Result<Option<FileInfo>>;

    /// List entries under `dir`. With `deep`, all descendants including the
    /// directory entries themselves.
    async fn list_files(
        &self,
        template: &ServiceTemplate,
        dir: &str,
        deep: bool,
    ) -> Result<Vec<FileInfo>>;

    async fn templates(&self) -> Result<BTreeSet<ServiceTemplate>>;
}

/// Storages by name.
#[derive(Default)]
pub struct TemplateStorageRegistry {
    storages: RwLock<HashMap<String, Arc<dyn TemplateStorage>>>,
}

impl TemplateStorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a storage under its name, replacing one with the same name.
    pub fn register(&self, storage: Arc<dyn TemplateStorage>) {
        self.storages
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(storage.name().to_string(), storage);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TemplateStorage>> {
        self.storages
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    /// Storage of `template`, or [`StorageError::UnknownStorage`].
    pub fn for_template(&self, template: &ServiceTemplate) -> Result<Arc<dyn TemplateStorage>> {
        self.get(&template.storage)
            .ok_or_else(|| StorageError::UnknownStorage(template.storage.clone()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .storages
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for TemplateStorageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateStorageRegistry")
            .field("storages", &self.names())
            .finish()
    }
}

/// Resolve a `/`-separated relative path below `root`.
///
/// Rejects absolute paths and `..` so callers cannot escape the template.
pub(crate) fn resolve_relative(root: &Path, path: &str) -> Result<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(path.trim_start_matches("./")).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return Err(StorageError::InvalidPath(path.to_string())),
        }
    }
    Ok(resolved)
}

/// Copy every file of `template` into `target_dir`.
pub async fn copy_template(
    storage: &dyn TemplateStorage,
    template: &ServiceTemplate,
    target_dir: &Path,
) -> Result<usize> {
    if !storage.has(template).await {
        return Err(StorageError::TemplateNotFound(template.to_string()));
    }

    let mut copied = 0;
    for entry in storage.list_files(template, "", true).await? {
        let target = resolve_relative(target_dir, &entry.path)?;
        if entry.directory {
            tokio::fs::create_dir_all(&target).await?;
            continue;
        }
        let Some(mut reader) = storage.new_input_stream(template, &entry.path).await? else {
            continue;
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&target).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        copied += 1;
    }

    debug!(template = %template, target = %target_dir.display(), files = copied, "Copied template");
    Ok(copied)
}

/// Push every regular file of `source_dir` not excluded by `deployment` into
/// its template.
pub async fn deploy_directory(
    storage: &dyn TemplateStorage,
    deployment: &ServiceDeployment,
    source_dir: &Path,
) -> Result<usize> {
    let template = &deployment.template;
    storage.create(template).await?;

    let mut deployed = 0;
    let mut pending = vec![(source_dir.to_path_buf(), String::new())];
    while let Some((dir, prefix)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            if deployment.is_excluded(&relative) {
                continue;
            }

            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push((entry.path(), relative));
            } else if file_type.is_file() {
                let mut source = tokio::fs::File::open(entry.path()).await?;
                let mut writer = storage.new_output_stream(template, &relative).await?;
                tokio::io::copy(&mut source, &mut writer).await?;
                tokio::io::AsyncWriteExt::shutdown(&mut writer).await?;
                deployed += 1;
            }
        }
    }

    debug!(template = %template, source = %source_dir.display(), files = deployed, "Deployed directory");
    Ok(deployed)
}
