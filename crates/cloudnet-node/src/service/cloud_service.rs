// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mutable runtime record of one local service and its lifecycle operations.
//!
//! Every operation takes `&mut self`; the manager wraps each service in its
//! own mutex so operations on one service never interleave while different
//! services proceed in parallel.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cloudnet_protocol::{ChannelMessage, InternalMessage, NetworkChannel};
use tracing::{debug, info, warn};

use crate::cluster::NodeServerProvider;
use crate::error::Result;
use crate::events::{CloudEvent, EventManager};
use crate::lifecycle::{LifecycleError, ServiceLifeCycle};
use crate::runner::{LaunchOptions, Runner, RunnerHandle};
use crate::service::{
    ServiceConfiguration, ServiceDeployment, ServiceId, ServiceInfoSnapshot,
    ServiceRemoteInclusion, ServiceTemplate,
};
use crate::template::{InclusionFetcher, TemplateStorageRegistry, copy_template, deploy_directory};

/// Collaborators shared by every service of a node.
pub struct ServiceContext {
    pub runner: Arc<dyn Runner>,
    pub storages: Arc<TemplateStorageRegistry>,
    pub fetcher: Arc<dyn InclusionFetcher>,
    pub events: Arc<EventManager>,
    pub servers: Arc<NodeServerProvider>,
    /// How long a process may take to exit after being asked to stop.
    pub stop_grace: Duration,
}

/// One managed service on this node.
#[derive(Debug)]
pub struct CloudService {
    configuration: ServiceConfiguration,
    lifecycle: ServiceLifeCycle,
    waiting_includes: VecDeque<ServiceRemoteInclusion>,
    waiting_templates: VecDeque<ServiceTemplate>,
    waiting_deployments: VecDeque<ServiceDeployment>,
    last_snapshot: ServiceInfoSnapshot,
    channel: Option<NetworkChannel>,
    working_dir: PathBuf,
    plugin_dir: PathBuf,
    handle: Option<RunnerHandle>,
    created_at: DateTime<Utc>,
}

impl CloudService {
    /// A new `PREPARED` service with the configured resources queued.
    pub fn new(configuration: ServiceConfiguration, working_dir: PathBuf) -> Self {
        let created_at = Utc::now();
        let last_snapshot = ServiceInfoSnapshot {
            service_id: configuration.service_id.clone(),
            lifecycle: ServiceLifeCycle::Prepared,
            connected: false,
            process_id: None,
            created_at,
            creation_time: created_at,
            sequence: 0,
        };
        let mut service = Self {
            waiting_includes: VecDeque::new(),
            waiting_templates: VecDeque::new(),
            waiting_deployments: configuration.deployments.iter().cloned().collect(),
            lifecycle: ServiceLifeCycle::Prepared,
            last_snapshot,
            channel: None,
            plugin_dir: working_dir.join("plugins"),
            working_dir,
            handle: None,
            created_at,
            configuration,
        };
        service.queue_configured_resources();
        service
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.configuration.service_id
    }

    pub fn configuration(&self) -> &ServiceConfiguration {
        &self.configuration
    }

    pub fn lifecycle(&self) -> ServiceLifeCycle {
        self.lifecycle
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn handle(&self) -> Option<&RunnerHandle> {
        self.handle.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_snapshot(&self) -> &ServiceInfoSnapshot {
        &self.last_snapshot
    }

    /// Link of the service process back to this node, if it connected.
    pub fn channel(&self) -> Option<&NetworkChannel> {
        self.channel.as_ref().filter(|channel| !channel.is_closed())
    }

    pub fn set_channel(&mut self, channel: Option<NetworkChannel>) {
        self.channel = channel;
    }

    pub fn add_waiting_template(&mut self, template: ServiceTemplate) {
        self.waiting_templates.push_back(template);
    }

    pub fn add_waiting_include(&mut self, inclusion: ServiceRemoteInclusion) {
        self.waiting_includes.push_back(inclusion);
    }

    pub fn add_waiting_deployment(&mut self, deployment: ServiceDeployment) {
        self.waiting_deployments.push_back(deployment);
    }

    pub fn waiting_templates(&self) -> impl Iterator<Item = &ServiceTemplate> {
        self.waiting_templates.iter()
    }

    pub fn waiting_includes(&self) -> impl Iterator<Item = &ServiceRemoteInclusion> {
        self.waiting_includes.iter()
    }

    pub fn waiting_deployments(&self) -> impl Iterator<Item = &ServiceDeployment> {
        self.waiting_deployments.iter()
    }

    fn queue_configured_resources(&mut self) {
        extend_unique(&mut self.waiting_templates, &self.configuration.templates);
        extend_unique(&mut self.waiting_includes, &self.configuration.inclusions);
    }

    /// Copy every waiting template into the working directory, in order.
    ///
    /// Failed templates stay queued in their original order. Returns the
    /// number applied.
    pub async fn include_waiting_templates(&mut self, ctx: &ServiceContext) -> usize {
        let pending: Vec<ServiceTemplate> = self.waiting_templates.drain(..).collect();
        let mut applied = 0;
        for template in pending {
            let result = match ctx.storages.for_template(&template) {
                Ok(storage) => copy_template(storage.as_ref(), &template, &self.working_dir).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => applied += 1,
                Err(e) => {
                    warn!(service = %self.service_id(), template = %template, error = %e, "Failed to include template, keeping it queued");
                    self.waiting_templates.push_back(template);
                }
            }
        }
        applied
    }

    /// Fetch every waiting inclusion, in order. Failures stay queued.
    pub async fn include_waiting_includes(&mut self, ctx: &ServiceContext) -> usize {
        let pending: Vec<ServiceRemoteInclusion> = self.waiting_includes.drain(..).collect();
        let mut applied = 0;
        for inclusion in pending {
            match ctx.fetcher.fetch(&inclusion, &self.working_dir).await {
                Ok(_) => applied += 1,
                Err(e) => {
                    warn!(service = %self.service_id(), url = %inclusion.url, error = %e, "Failed to fetch inclusion, keeping it queued");
                    self.waiting_includes.push_back(inclusion);
                }
            }
        }
        applied
    }

    /// Push the working directory into every waiting deployment's template,
    /// in order. Failures stay queued.
    pub async fn deploy_resources(&mut self, ctx: &ServiceContext) -> usize {
        let pending: Vec<ServiceDeployment> = self.waiting_deployments.drain(..).collect();
        let mut applied = 0;
        for deployment in pending {
            let result = match ctx.storages.for_template(&deployment.template) {
                Ok(storage) => {
                    deploy_directory(storage.as_ref(), &deployment, &self.working_dir).await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => applied += 1,
                Err(e) => {
                    warn!(service = %self.service_id(), template = %deployment.template, error = %e, "Failed to deploy, keeping it queued");
                    self.waiting_deployments.push_back(deployment);
                }
            }
        }
        applied
    }

    /// PREPARED → RUNNING: templates, then inclusions, then the process.
    ///
    /// A failed spawn leaves the service `PREPARED`.
    pub async fn start(&mut self, ctx: &ServiceContext) -> Result<()> {
        self.announce(ctx, ServiceLifeCycle::Running)?;

        tokio::fs::create_dir_all(&self.plugin_dir).await?;
        self.include_waiting_templates(ctx).await;
        self.include_waiting_includes(ctx).await;

        let options = LaunchOptions {
            service_name: self.service_id().name(),
            service_id: self.service_id().unique_id(),
            program: self.configuration.command.clone(),
            args: self.configuration.args.clone(),
            working_dir: self.working_dir.clone(),
            env: self.configuration.env.clone(),
        };
        let handle = ctx.runner.launch(&options).await?;
        info!(service = %self.service_id(), pid = ?handle.pid, "Service started");
        self.handle = Some(handle);

        self.commit(ctx, ServiceLifeCycle::Running);
        Ok(())
    }

    /// → STOPPED: deployments, then the process is asked to exit and awaited.
    pub async fn stop(&mut self, ctx: &ServiceContext) -> Result<()> {
        self.announce(ctx, ServiceLifeCycle::Stopped)?;
        self.shutdown_process(ctx).await?;
        self.commit(ctx, ServiceLifeCycle::Stopped);
        Ok(())
    }

    /// STOPPED → PREPARED, queueing the configured resources again.
    pub async fn prepare(&mut self, ctx: &ServiceContext) -> Result<()> {
        self.announce(ctx, ServiceLifeCycle::Prepared)?;
        self.handle = None;
        self.queue_configured_resources();
        extend_unique(&mut self.waiting_deployments, &self.configuration.deployments);
        self.commit(ctx, ServiceLifeCycle::Prepared);
        Ok(())
    }

    /// → DELETED. Stops a running process first (best effort) and removes the
    /// working directory of non-static services.
    pub async fn delete(&mut self, ctx: &ServiceContext) -> Result<()> {
        self.announce(ctx, ServiceLifeCycle::Deleted)?;

        if let Err(e) = self.shutdown_process(ctx).await {
            warn!(service = %self.service_id(), error = %e, "Failed to stop service before delete");
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        if !self.configuration.static_service
            && let Err(e) = tokio::fs::remove_dir_all(&self.working_dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(service = %self.service_id(), error = %e, "Failed to remove working directory");
        }

        self.commit(ctx, ServiceLifeCycle::Deleted);
        Ok(())
    }

    /// Detect a process that exited on its own and move to STOPPED.
    ///
    /// Returns whether the service changed state.
    pub async fn handle_process_exit(&mut self, ctx: &ServiceContext) -> bool {
        if self.lifecycle != ServiceLifeCycle::Running {
            return false;
        }
        let Some(handle) = self.handle.clone() else {
            return false;
        };
        if ctx.runner.is_running(&handle).await {
            return false;
        }

        let exit_code = ctx.runner.exit_code(&handle).await;
        info!(service = %self.service_id(), exit_code = ?exit_code, "Service process exited");
        self.deploy_resources(ctx).await;
        self.commit(ctx, ServiceLifeCycle::Stopped);
        true
    }

    /// Take a fresh snapshot, raise it locally and broadcast it to peers.
    pub fn publish_service_info_snapshot(&mut self, ctx: &ServiceContext) -> ServiceInfoSnapshot {
        let snapshot = ServiceInfoSnapshot {
            service_id: self.configuration.service_id.clone(),
            lifecycle: self.lifecycle,
            connected: self.channel().is_some(),
            process_id: self.handle.as_ref().and_then(|handle| handle.pid),
            created_at: Utc::now(),
            creation_time: self.created_at,
            sequence: self.last_snapshot.sequence + 1,
        };
        self.last_snapshot = snapshot.clone();

        publish_snapshot(&ctx.events, &ctx.servers, &snapshot);
        snapshot
    }

    async fn shutdown_process(&mut self, ctx: &ServiceContext) -> Result<()> {
        if self.lifecycle != ServiceLifeCycle::Running {
            return Ok(());
        }
        self.deploy_resources(ctx).await;
        if let Some(handle) = &self.handle {
            ctx.runner.stop(handle, ctx.stop_grace).await?;
            debug!(service = %self.service_id(), "Service process exited");
        }
        Ok(())
    }

    /// Validate the transition and let listeners veto it.
    fn announce(&self, ctx: &ServiceContext, to: ServiceLifeCycle) -> Result<()> {
        let from = self.lifecycle;
        from.check_transition(to)?;

        let outcome = ctx.events.publish(&CloudEvent::ServiceLifecyclePre {
            service_id: self.service_id().clone(),
            from,
            to,
        });
        if outcome.is_cancelled() {
            debug!(service = %self.service_id(), %from, %to, "Lifecycle change cancelled");
            return Err(LifecycleError::Cancelled { from, to }.into());
        }
        Ok(())
    }

    fn commit(&mut self, ctx: &ServiceContext, to: ServiceLifeCycle) {
        let from = std::mem::replace(&mut self.lifecycle, to);
        ctx.events.publish(&CloudEvent::ServiceLifecycleChanged {
            service_id: self.service_id().clone(),
            from,
            to,
        });
        self.publish_service_info_snapshot(ctx);
    }
}

/// Queue `items` that are not already waiting.
fn extend_unique<T: PartialEq + Clone>(queue: &mut VecDeque<T>, items: &[T]) {
    for item in items {
        if !queue.contains(item) {
            queue.push_back(item.clone());
        }
    }
}

/// Raise [`CloudEvent::ServiceInfoUpdated`] and broadcast `update_service_info`.
pub(crate) fn publish_snapshot(
    events: &EventManager,
    servers: &NodeServerProvider,
    snapshot: &ServiceInfoSnapshot,
) {
    events.publish(&CloudEvent::ServiceInfoUpdated {
        snapshot: snapshot.clone(),
    });
    match serde_json::to_vec(snapshot) {
        Ok(content) => {
            servers.broadcast(&ChannelMessage::internal(
                InternalMessage::UpdateServiceInfo,
                content,
            ));
        }
        Err(e) => warn!(service = %snapshot.service_id, error = %e, "Failed to encode service snapshot"),
    }
}
