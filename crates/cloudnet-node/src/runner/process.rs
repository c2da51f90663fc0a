// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Native process runner.
//!
//! Spawns the service command directly in its working directory. Stopping
//! sends SIGTERM and falls back to SIGKILL once the grace period elapsed.

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::traits::*;

enum ProcessState {
    Running(Child),
    Exited(Option<i32>),
}

/// Runner spawning one OS process per service.
#[derive(Default)]
pub struct ProcessRunner {
    processes: Mutex<HashMap<String, ProcessState>>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn send_sigterm(pid: u32) -> Result<()> {
        let Ok(raw) = i32::try_from(pid) else {
            return Err(RunnerError::Signal(format!("pid {} out of range", pid)));
        };
        match signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => {
                debug!(pid = pid, "Sent SIGTERM to process");
                Ok(())
            }
            Err(nix::errno::Errno::ESRCH) => {
                debug!(pid = pid, "Process already dead (ESRCH)");
                Ok(())
            }
            Err(e) => Err(RunnerError::Signal(e.to_string())),
        }
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    fn runner_type(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, options: &LaunchOptions) -> Result<RunnerHandle> {
        let mut cmd = Command::new(&options.program);
        cmd.args(&options.args)
            .current_dir(&options.working_dir)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RunnerError::ProgramNotFound(options.program.clone()),
            _ => RunnerError::StartFailed(e.to_string()),
        })?;

        let pid = child.id();
        let handle = RunnerHandle {
            handle_id: format!("{}_{}", options.service_name, options.service_id.simple()),
            service_id: options.service_id,
            started_at: Utc::now(),
            pid,
        };

        info!(
            service = %options.service_name,
            pid = ?pid,
            program = %options.program,
            "Spawned service process"
        );

        self.processes
            .lock()
            .await
            .insert(handle.handle_id.clone(), ProcessState::Running(child));
        Ok(handle)
    }

    async fn is_running(&self, handle: &RunnerHandle) -> bool {
        let mut processes = self.processes.lock().await;
        let Some(state) = processes.get_mut(&handle.handle_id) else {
            return false;
        };
        let ProcessState::Running(child) = state else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                *state = ProcessState::Exited(status.code());
                false
            }
            Err(e) => {
                warn!(handle = %handle.handle_id, error = %e, "Failed to poll process");
                false
            }
        }
    }

    async fn stop(&self, handle: &RunnerHandle, grace: Duration) -> Result<()> {
        // take the child out so other handles are not blocked while waiting
        let child = {
            let mut processes = self.processes.lock().await;
            match processes.remove(&handle.handle_id) {
                Some(ProcessState::Running(child)) => child,
                Some(exited @ ProcessState::Exited(_)) => {
                    processes.insert(handle.handle_id.clone(), exited);
                    return Ok(());
                }
                None => return Err(RunnerError::UnknownHandle(handle.handle_id.clone())),
            }
        };
        let mut child = child;

        if let Some(pid) = child.id() {
            Self::send_sigterm(pid)?;
        }

        let status = match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    handle = %handle.handle_id,
                    grace_ms = grace.as_millis() as u64,
                    "Process ignored SIGTERM, killing"
                );
                child.kill().await?;
                child.wait().await?
            }
        };

        self.processes.lock().await.insert(
            handle.handle_id.clone(),
            ProcessState::Exited(status.code()),
        );
        Ok(())
    }

    async fn exit_code(&self, handle: &RunnerHandle) -> Option<i32> {
        match self.processes.lock().await.get(&handle.handle_id) {
            Some(ProcessState::Exited(code)) => *code,
            _ => None,
        }
    }
}
