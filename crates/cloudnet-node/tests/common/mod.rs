// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for cloudnet-node integration tests.
//!
//! Nodes are wired with [`NodeContext`] and linked over in-memory duplex
//! streams instead of QUIC.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cloudnet_node::cluster::NetworkClusterNode;
use cloudnet_node::config::NodeConfig;
use cloudnet_node::runner::MockRunner;
use cloudnet_node::service::{LOCAL_STORAGE, ServiceRemoteInclusion, ServiceTemplate};
use cloudnet_node::template::{
    FileInclusionFetcher, FileInfo, InclusionFetcher, LocalTemplateStorage, StorageError,
    StorageReader, StorageWriter, TemplateStorage,
};
use cloudnet_node::NodeContext;
use cloudnet_protocol::{ChannelMessage, NetworkChannel};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered record of storage, fetcher and runner calls.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

/// One node with its own data directory.
pub struct TestNode {
    pub ctx: Arc<NodeContext>,
    pub runner: Arc<MockRunner>,
    pub journal: Journal,
    pub storage: Arc<RecordingStorage>,
    pub data_dir: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TestNode {
    /// Node `id` knowing `peers`. Relayed command lines are answered with
    /// `"<id>: <line>"`.
    pub fn new(id: &str, peers: &[&str]) -> Self {
        Self::with_runner(id, peers, MockRunner::new())
    }

    pub fn with_runner(id: &str, peers: &[&str], runner: MockRunner) -> Self {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let data_dir = temp_dir.path().to_path_buf();
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));

        let mut config = NodeConfig::new(id);
        config.data_dir = data_dir.clone();
        config.query_timeout = TIMEOUT;
        config.cluster_nodes = peers
            .iter()
            .map(|peer| NetworkClusterNode::new(*peer, vec![SocketAddr::from(([127, 0, 0, 1], 1410))]))
            .collect();

        let runner = Arc::new(runner.with_journal(journal.clone()));
        let node_id = id.to_string();
        let ctx = NodeContext::new(
            config,
            runner.clone(),
            Arc::new(move |line: &str| vec![format!("{}: {}", node_id, line)]),
            Arc::new(RecordingFetcher {
                journal: journal.clone(),
            }),
        )
        .unwrap();

        let storage = Arc::new(RecordingStorage::new(
            ctx.config().local_templates_dir(),
            journal.clone(),
        ));
        ctx.storages().register(storage.clone());

        Self {
            ctx: Arc::new(ctx),
            runner,
            journal,
            storage,
            data_dir,
            _temp_dir: temp_dir,
        }
    }

    pub fn id(&self) -> &str {
        self.ctx.unique_id()
    }
}

/// Open a link between two nodes and bind it on both sides.
///
/// Returns `(a's channel to b, b's channel to a)`.
pub fn link(a: &TestNode, b: &TestNode) -> (NetworkChannel, NetworkChannel) {
    let (a_io, b_io) = tokio::io::duplex(256 * 1024);
    let (a_read, a_write) = tokio::io::split(a_io);
    let (b_read, b_write) = tokio::io::split(b_io);

    let a_to_b = bound_channel(a, b.id(), a_read, a_write);
    let b_to_a = bound_channel(b, a.id(), b_read, b_write);
    (a_to_b, b_to_a)
}

/// Like [`link`], but `dialer` binds its side as an outgoing connection and
/// requests the initial cluster data before `acceptor` has bound its side.
///
/// Returns `(dialer's channel, acceptor's channel)`.
pub fn dial(dialer: &TestNode, acceptor: &TestNode) -> (NetworkChannel, NetworkChannel) {
    let (d_io, a_io) = tokio::io::duplex(256 * 1024);
    let (d_read, d_write) = tokio::io::split(d_io);
    let (a_read, a_write) = tokio::io::split(a_io);

    let outgoing = NetworkChannel::spawn(acceptor.id(), d_read, d_write, dialer.ctx.inbound_handler());
    dialer.ctx.connect_channel(outgoing.clone()).unwrap();
    let incoming = bound_channel(acceptor, dialer.id(), a_read, a_write);
    (outgoing, incoming)
}

/// Spawn `node`'s side of a link to `peer`, attached before any dispatch.
fn bound_channel<R, W>(node: &TestNode, peer: &str, reader: R, writer: W) -> NetworkChannel
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let ctx = node.ctx.clone();
    NetworkChannel::spawn_bound(peer, reader, writer, node.ctx.inbound_handler(), move |channel| {
        ctx.attach_channel(channel.clone()).map(|_| ())
    })
    .unwrap()
}

/// Wait until the peer processed everything sent on `channel` so far.
pub async fn barrier(channel: &NetworkChannel) {
    let message = ChannelMessage::new("test_barrier", "ping", Bytes::new());
    channel.send_query(&message, TIMEOUT).await.unwrap();
}

/// Poll `condition` until it holds or [`TIMEOUT`] passes.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            TIMEOUT
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Local storage that records template copies and deployments and can be
/// taken offline.
pub struct RecordingStorage {
    inner: LocalTemplateStorage,
    journal: Journal,
    offline: AtomicBool,
}

impl RecordingStorage {
    pub fn new(base: impl Into<PathBuf>, journal: Journal) -> Self {
        Self {
            inner: LocalTemplateStorage::new(LOCAL_STORAGE, base),
            journal,
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Create `template` holding `files` as `(path, content)` pairs.
    pub async fn seed(&self, template: &ServiceTemplate, files: &[(&str, &str)]) {
        self.inner.create(template).await.unwrap();
        for (path, content) in files {
            let mut writer = self.inner.new_output_stream(template, path).await.unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut writer, content.as_bytes())
                .await
                .unwrap();
            tokio::io::AsyncWriteExt::shutdown(&mut writer).await.unwrap();
        }
    }

    pub async fn read(&self, template: &ServiceTemplate, path: &str) -> Option<String> {
        let mut reader = self.inner.new_input_stream(template, path).await.unwrap()?;
        let mut content = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut content)
            .await
            .unwrap();
        Some(content)
    }

    fn online(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StorageError::Io(std::io::Error::other("storage offline")))
        } else {
            Ok(())
        }
    }

    fn record(&self, entry: String) {
        self.journal.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl TemplateStorage for RecordingStorage {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn create(&self, template: &ServiceTemplate) -> Result<bool, StorageError> {
        self.online()?;
        self.record(format!("deploy:{}", template.full_name()));
        self.inner.create(template).await
    }

    async fn has(&self, template: &ServiceTemplate) -> bool {
        if self.online().is_err() {
            return false;
        }
        self.record(format!("template:{}", template.full_name()));
        self.inner.has(template).await
    }

    async fn delete(&self, template: &ServiceTemplate) -> Result<bool, StorageError> {
        self.online()?;
        self.inner.delete(template).await
    }

    async fn new_output_stream(
        &self,
        template: &ServiceTemplate,
        path: &str,
    ) -> Result<StorageWriter, StorageError> {
        self.online()?;
        self.inner.new_output_stream(template, path).await
    }

    async fn append_output_stream(
        &self,
        template: &ServiceTemplate,
        path: &str,
    ) -> Result<StorageWriter, StorageError> {
        self.online()?;
        self.inner.append_output_stream(template, path).await
    }

    async fn new_input_stream(
        &self,
        template: &ServiceTemplate,
        path: &str,
    ) -> Result<Option<StorageReader>, StorageError> {
        self.online()?;
        self.inner.new_input_stream(template, path).await
    }

    async fn create_file(&self, template: &ServiceTemplate, path: &str) -> Result<bool, StorageError> {
        self.online()?;
        self.inner.create_file(template, path).await
    }

    async fn create_directory(
        &self,
        template: &ServiceTemplate,
        path: &str,
    ) -> Result<bool, StorageError> {
        self.online()?;
        self.inner.create_directory(template, path).await
    }

    async fn has_file(&self, template: &ServiceTemplate, path: &str) -> Result<bool, StorageError> {
        self.online()?;
        self.inner.has_file(template, path).await
    }

    async fn delete_file(&self, template: &ServiceTemplate, path: &str) -> Result<bool, StorageError> {
        self.online()?;
        self.inner.delete_file(template, path).await
    }

    async fn file_info(
        &self,
        template: &ServiceTemplate,
        path: &str,
    ) -> Result<Option<FileInfo>, StorageError> {
        self.online()?;
        self.inner.file_info(template, path).await
    }

    async fn list_files(
        &self,
        template: &ServiceTemplate,
        dir: &str,
        deep: bool,
    ) -> Result<Vec<FileInfo>, StorageError> {
        self.online()?;
        self.inner.list_files(template, dir, deep).await
    }

    async fn templates(&self) -> Result<BTreeSet<ServiceTemplate>, StorageError> {
        self.online()?;
        self.inner.templates().await
    }
}

/// File fetcher that records every inclusion it is asked for.
pub struct RecordingFetcher {
    journal: Journal,
}

#[async_trait]
impl InclusionFetcher for RecordingFetcher {
    async fn fetch(
        &self,
        inclusion: &ServiceRemoteInclusion,
        working_dir: &Path,
    ) -> Result<PathBuf, StorageError> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("include:{}", inclusion.destination));
        FileInclusionFetcher.fetch(inclusion, working_dir).await
    }
}
