// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Template storage on the local filesystem.
//!
//! Layout: `<base>/<prefix>/<name>/<files>`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::{self, OpenOptions};

use super::{
    FileInfo, Result, StorageError, StorageReader, StorageWriter, TemplateStorage,
    resolve_relative,
};
use crate::service::ServiceTemplate;

/// Storage rooted at a directory, usually `<data>/local/templates`.
#[derive(Debug, Clone)]
pub struct LocalTemplateStorage {
    name: String,
    base: PathBuf,
}

impl LocalTemplateStorage {
    pub fn new(name: impl Into<String>, base: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            base: base.into(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn template_dir(&self, template: &ServiceTemplate) -> Result<PathBuf> {
        let prefix = resolve_relative(&self.base, &template.prefix)?;
        let dir = resolve_relative(&prefix, &template.name)?;
        if dir == self.base || prefix == self.base {
            return Err(StorageError::InvalidPath(template.full_name()));
        }
        Ok(dir)
    }

    fn file_path(&self, template: &ServiceTemplate, path: &str) -> Result<PathBuf> {
        resolve_relative(&self.template_dir(template)?, path)
    }

    async fn writer(
        &self,
        template: &ServiceTemplate,
        path: &str,
        append: bool,
    ) -> Result<StorageWriter> {
        let target = self.file_path(template, path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        Ok(Box::new(options.open(target).await?))
    }
}

async fn entry_info(path: &Path, relative: String) -> Result<FileInfo> {
    let metadata = fs::metadata(path).await?;
    let name = relative
        .rsplit('/')
        .next()
        .unwrap_or(relative.as_str())
        .to_string();
    Ok(FileInfo {
        name,
        directory: metadata.is_dir(),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        path: relative,
    })
}

fn join_relative(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

#[async_trait]
impl TemplateStorage for LocalTemplateStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, template: &ServiceTemplate) -> Result<bool> {
        let dir = self.template_dir(template)?;
        if fs::try_exists(&dir).await? {
            return Ok(false);
        }
        fs::create_dir_all(&dir).await?;
        Ok(true)
    }

    async fn has(&self, template: &ServiceTemplate) -> bool {
        match self.template_dir(template) {
            Ok(dir) => fs::metadata(dir).await.is_ok_and(|m| m.is_dir()),
            Err(_) => false,
        }
    }

    async fn delete(&self, template: &ServiceTemplate) -> Result<bool> {
        let dir = self.template_dir(template)?;
        if !fs::try_exists(&dir).await? {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).await?;
        Ok(true)
    }

    async fn new_output_stream(
        &self,
        template: &ServiceTemplate,
        path: &str,
    ) -> Result<StorageWriter> {
        self.writer(template, path, false).await
    }

    async fn append_output_stream(
        &self,
        template: &ServiceTemplate,
        path: &str,
    ) -> Result<StorageWriter> {
        self.writer(template, path, true).await
    }

    async fn new_input_stream(
        &self,
        template: &ServiceTemplate,
        path: &str,
    ) -> Result<Option<StorageReader>> {
        let source = self.file_path(template, path)?;
        match fs::File::open(&source).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_file(&self, template: &ServiceTemplate, path: &str) -> Result<bool> {
        let target = self.file_path(template, path)?;
        if fs::try_exists(&target).await? {
            return Ok(false);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::File::create(&target).await?;
        Ok(true)
    }

    async fn create_directory(&self, template: &ServiceTemplate, path: &str) -> Result<bool> {
        let target = self.file_path(template, path)?;
        if fs::try_exists(&target).await? {
            return Ok(false);
        }
        fs::create_dir_all(&target).await?;
        Ok(true)
    }

    async fn has_file(&self, template: &ServiceTemplate, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.file_path(template, path)?).await?)
    }

    async fn delete_file(&self, template: &ServiceTemplate, path: &str) -> Result<bool> {
        let target = self.file_path(template, path)?;
        let metadata = match fs::metadata(&target).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            fs::remove_dir_all(&target).await?;
        } else {
            fs::remove_file(&target).await?;
        }
        Ok(true)
    }

    async fn file_info(&self, template: &ServiceTemplate, path: &str) -> Result<Option<FileInfo>> {
        let target = self.file_path(template, path)?;
        if !fs::try_exists(&target).await? {
            return Ok(None);
        }
        let relative = path.trim_matches('/').to_string();
        Ok(Some(entry_info(&target, relative).await?))
    }

    async fn list_files(
        &self,
        template: &ServiceTemplate,
        dir: &str,
        deep: bool,
    ) -> Result<Vec<FileInfo>> {
        let root = self.file_path(template, dir)?;
        if !fs::metadata(&root).await.is_ok_and(|m| m.is_dir()) {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut pending = vec![(root, dir.trim_matches('/').to_string())];
        while let Some((current, prefix)) = pending.pop() {
            let mut entries = fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let relative = join_relative(&prefix, &name);
                let info = entry_info(&entry.path(), relative.clone()).await?;
                if deep && info.directory {
                    pending.push((entry.path(), relative));
                }
                files.push(info);
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn templates(&self) -> Result<BTreeSet<ServiceTemplate>> {
        let mut templates = BTreeSet::new();
        let mut prefixes = match fs::read_dir(&self.base).await {
            Ok(prefixes) => prefixes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(templates),
            Err(e) => return Err(e.into()),
        };
        while let Some(prefix) = prefixes.next_entry().await? {
            if !prefix.file_type().await?.is_dir() {
                continue;
            }
            let prefix_name = prefix.file_name().to_string_lossy().into_owned();
            let mut names = fs::read_dir(prefix.path()).await?;
            while let Some(name) = names.next_entry().await? {
                if name.file_type().await?.is_dir() {
                    templates.insert(ServiceTemplate::new(
                        prefix_name.clone(),
                        name.file_name().to_string_lossy().into_owned(),
                        self.name.clone(),
                    ));
                }
            }
        }
        Ok(templates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{copy_template, deploy_directory};
    use crate::service::ServiceDeployment;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn storage(dir: &TempDir) -> LocalTemplateStorage {
        LocalTemplateStorage::new("local", dir.path().join("templates"))
    }

    async fn write(storage: &LocalTemplateStorage, template: &ServiceTemplate, path: &str, data: &[u8]) {
        let mut writer = storage.new_output_stream(template, path).await.unwrap();
        writer.write_all(data).await.unwrap();
        writer.shutdown().await.unwrap();
    }

    async fn read(storage: &LocalTemplateStorage, template: &ServiceTemplate, path: &str) -> String {
        let mut reader = storage
            .new_input_stream(template, path)
            .await
            .unwrap()
            .unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).await.unwrap();
        content
    }

    #[tokio::test]
    async fn test_create_has_delete() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let template = ServiceTemplate::local("Lobby", "default");

        assert!(!storage.has(&template).await);
        assert!(storage.create(&template).await.unwrap());
        assert!(!storage.create(&template).await.unwrap());
        assert!(storage.has(&template).await);
        assert_eq!(
            storage.templates().await.unwrap().into_iter().collect::<Vec<_>>(),
            vec![template.clone()]
        );
        assert!(storage.delete(&template).await.unwrap());
        assert!(!storage.delete(&template).await.unwrap());
    }

    #[tokio::test]
    async fn test_streams_and_files() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let template = ServiceTemplate::local("Lobby", "default");

        write(&storage, &template, "server.properties", b"motd=hi\n").await;
        let mut append = storage
            .append_output_stream(&template, "server.properties")
            .await
            .unwrap();
        append.write_all(b"port=25565\n").await.unwrap();
        append.shutdown().await.unwrap();

        assert_eq!(
            read(&storage, &template, "server.properties").await,
            "motd=hi\nport=25565\n"
        );
        assert!(
            storage
                .new_input_stream(&template, "missing.txt")
                .await
                .unwrap()
                .is_none()
        );

        assert!(storage.create_file(&template, "eula.txt").await.unwrap());
        assert!(!storage.create_file(&template, "eula.txt").await.unwrap());
        assert!(storage.has_file(&template, "eula.txt").await.unwrap());
        let info = storage
            .file_info(&template, "server.properties")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.name, "server.properties");
        assert_eq!(info.size, 19);
        assert!(!info.directory);

        assert!(storage.delete_file(&template, "eula.txt").await.unwrap());
        assert!(!storage.delete_file(&template, "eula.txt").await.unwrap());
        assert!(matches!(
            storage.has_file(&template, "../../escape").await,
            Err(StorageError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_deep_listing_includes_directories() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let template = ServiceTemplate::local("Lobby", "default");

        write(&storage, &template, "server.jar", b"jar").await;
        write(&storage, &template, "plugins/a.jar", b"a").await;
        write(&storage, &template, "plugins/config/a.yml", b"x: 1").await;

        let shallow: Vec<String> = storage
            .list_files(&template, "", false)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(shallow, vec!["plugins", "server.jar"]);

        let deep = storage.list_files(&template, "", true).await.unwrap();
        let paths: Vec<&str> = deep.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "plugins",
                "plugins/a.jar",
                "plugins/config",
                "plugins/config/a.yml",
                "server.jar"
            ]
        );
        assert!(deep[0].directory);
        assert!(deep[2].directory);

        let sub: Vec<String> = storage
            .list_files(&template, "plugins", true)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(sub, vec!["plugins/a.jar", "plugins/config", "plugins/config/a.yml"]);
    }

    #[tokio::test]
    async fn test_copy_and_deploy() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let template = ServiceTemplate::local("Lobby", "default");
        write(&storage, &template, "plugins/a.jar", b"a").await;
        write(&storage, &template, "server.properties", b"motd=hi").await;

        let work = dir.path().join("work");
        assert_eq!(copy_template(&storage, &template, &work).await.unwrap(), 2);
        assert_eq!(
            tokio::fs::read_to_string(work.join("plugins/a.jar")).await.unwrap(),
            "a"
        );

        tokio::fs::create_dir_all(work.join("logs")).await.unwrap();
        tokio::fs::write(work.join("logs/latest.log"), "log").await.unwrap();
        tokio::fs::write(work.join("world.dat"), "world").await.unwrap();

        let target = ServiceTemplate::local("Lobby", "backup");
        let deployment = ServiceDeployment::new(target.clone(), vec!["logs".to_string()]);
        assert_eq!(deploy_directory(&storage, &deployment, &work).await.unwrap(), 3);
        assert!(storage.has_file(&target, "world.dat").await.unwrap());
        assert!(storage.has_file(&target, "plugins/a.jar").await.unwrap());
        assert!(!storage.has_file(&target, "logs/latest.log").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_missing_template() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let result = copy_template(
            &storage,
            &ServiceTemplate::local("Missing", "default"),
            dir.path(),
        )
        .await;
        assert!(matches!(result, Err(StorageError::TemplateNotFound(_))));
    }
}
