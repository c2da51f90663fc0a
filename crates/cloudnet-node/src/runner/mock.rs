// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runner for testing.
//!
//! Simulates service processes without spawning anything. Processes stay
//! alive until stopped or until [`MockRunner::exit`] is called.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;

use super::traits::*;

/// Mock process state.
#[derive(Debug, Clone)]
struct MockProcess {
    running: bool,
    exit_code: Option<i32>,
}

/// Mock runner for testing.
pub struct MockRunner {
    processes: Arc<Mutex<HashMap<String, MockProcess>>>,
    launches: AtomicU64,
    /// If true, launches fail
    fail_launch: AtomicBool,
    journal: Option<Arc<StdMutex<Vec<String>>>>,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    /// Create a new mock runner.
    pub fn new() -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            launches: AtomicU64::new(0),
            fail_launch: AtomicBool::new(false),
            journal: None,
        }
    }

    /// Create a mock runner whose launches fail.
    pub fn failing() -> Self {
        let runner = Self::new();
        runner.fail_launch.store(true, Ordering::SeqCst);
        runner
    }

    /// Record `launch:<service>` and `stop:<service>` entries into `journal`.
    pub fn with_journal(mut self, journal: Arc<StdMutex<Vec<String>>>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    /// Number of successful launches.
    pub fn launch_count(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }

    /// Simulate the process exiting on its own.
    pub async fn exit(&self, handle_id: &str, code: i32) {
        let mut processes = self.processes.lock().await;
        if let Some(process) = processes.get_mut(handle_id) {
            process.running = false;
            process.exit_code = Some(code);
        }
    }

    fn record(&self, entry: String) {
        if let Some(journal) = &self.journal {
            journal
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(entry);
        }
    }
}

#[async_trait]
impl Runner for MockRunner {
    fn runner_type(&self) -> &'static str {
        "mock"
    }

    async fn launch(&self, options: &LaunchOptions) -> Result<RunnerHandle> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(RunnerError::StartFailed("Mock failure".to_string()));
        }

        let sequence = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = RunnerHandle {
            handle_id: format!("mock_{}_{}", options.service_name, sequence),
            service_id: options.service_id,
            started_at: Utc::now(),
            pid: None, // Mock doesn't spawn real processes
        };

        self.processes.lock().await.insert(
            handle.handle_id.clone(),
            MockProcess {
                running: true,
                exit_code: None,
            },
        );
        self.record(format!("launch:{}", options.service_name));

        Ok(handle)
    }

    async fn is_running(&self, handle: &RunnerHandle) -> bool {
        let processes = self.processes.lock().await;
        processes
            .get(&handle.handle_id)
            .map(|p| p.running)
            .unwrap_or(false)
    }

    async fn stop(&self, handle: &RunnerHandle, _grace: Duration) -> Result<()> {
        let mut processes = self.processes.lock().await;
        let process = processes
            .get_mut(&handle.handle_id)
            .ok_or_else(|| RunnerError::UnknownHandle(handle.handle_id.clone()))?;
        if process.running {
            process.running = false;
            process.exit_code = Some(0);
        }
        drop(processes);

        let name = handle
            .handle_id
            .strip_prefix("mock_")
            .and_then(|rest| rest.rsplit_once('_'))
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| handle.handle_id.clone());
        self.record(format!("stop:{}", name));
        Ok(())
    }

    async fn exit_code(&self, handle: &RunnerHandle) -> Option<i32> {
        let processes = self.processes.lock().await;
        processes.get(&handle.handle_id).and_then(|p| p.exit_code)
    }
}
