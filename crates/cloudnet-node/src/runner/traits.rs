// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner trait definitions.
//!
//! Defines the abstract interface for service process control.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors from runner operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// Program executable was not found.
    #[error("Program not found: {0}")]
    ProgramNotFound(String),

    /// Process failed to start.
    #[error("Process start failed: {0}")]
    StartFailed(String),

    /// No process is known for the handle.
    #[error("Unknown process handle: {0}")]
    UnknownHandle(String),

    /// Signal delivery failed.
    #[error("Signal failed: {0}")]
    Signal(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Options for launching a service process.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Service display name (`task-index`)
    pub service_name: String,
    /// Service unique id
    pub service_id: Uuid,
    /// Program to execute
    pub program: String,
    /// Program arguments
    pub args: Vec<String>,
    /// Working directory the process runs in
    pub working_dir: PathBuf,
    /// Environment variables added to the inherited environment
    pub env: BTreeMap<String, String>,
}

/// Handle for a launched service process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerHandle {
    /// Unique identifier for this launch
    pub handle_id: String,
    /// Service unique id
    pub service_id: Uuid,
    /// When the process was started
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// OS process id, if the runner spawns real processes
    pub pid: Option<u32>,
}

/// Trait for process runners.
///
/// Runners only start, observe and stop processes. Lifecycle bookkeeping
/// is done by the caller.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Runner type identifier (e.g., "process", "mock")
    fn runner_type(&self) -> &'static str;

    /// Spawn the process without waiting for it.
    async fn launch(&self, options: &LaunchOptions) -> Result<RunnerHandle>;

    /// Check if the process is still alive.
    async fn is_running(&self, handle: &RunnerHandle) -> bool;

    /// Ask the process to exit and wait up to `grace` before killing it.
    ///
    /// Returns once the process has exited.
    async fn stop(&self, handle: &RunnerHandle, grace: Duration) -> Result<()>;

    /// Exit code of a finished process. `None` while running or when unknown.
    async fn exit_code(&self, handle: &RunnerHandle) -> Option<i32>;
}
