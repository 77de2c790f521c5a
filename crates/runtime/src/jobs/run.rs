//! Run-container job: launch a container from an image (or reuse an
//! existing one), observe it to completion, and capture its logs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;

use super::{map_exit_code, Job, JobCore};
use crate::execution::Context;
use crate::hash::FieldHasher;
use crate::provider::{
    ContainerConfig, ContainerProvider, ContainerState, EventFilter, HostConfig, LogStreamKind,
    LogsOptions,
};
use crate::types::{JobError, ProviderError};

/// Inspect interval for the polling fallback watch path.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct RunJob {
    pub core: JobCore,
    pub image: String,
    /// Reuse this existing container instead of creating one.
    pub container: Option<String>,
    /// Name for the created container. `None` uses the job name; an empty
    /// string lets the provider assign one.
    pub container_name: Option<String>,
    /// Force a registry pull before looking locally.
    pub pull: bool,
    /// Remove the created container on every exit path.
    pub delete: bool,
    pub user: Option<String>,
    pub tty: bool,
    pub env: Vec<String>,
    pub entrypoint: Option<String>,
    pub network: Option<String>,
    pub volumes: Vec<String>,
    pub volumes_from: Vec<String>,
    pub annotations: BTreeMap<String, String>,
    /// Watch deadline. `None` means no timeout.
    pub max_runtime: Option<Duration>,
    provider: Arc<dyn ContainerProvider>,
    container_id: Mutex<Option<String>>,
}

impl RunJob {
    pub fn new(
        core: JobCore,
        image: impl Into<String>,
        provider: Arc<dyn ContainerProvider>,
    ) -> Self {
        Self {
            core,
            image: image.into(),
            container: None,
            container_name: None,
            pull: false,
            delete: true,
            user: None,
            tty: false,
            env: Vec::new(),
            entrypoint: None,
            network: None,
            volumes: Vec::new(),
            volumes_from: Vec::new(),
            annotations: BTreeMap::new(),
            max_runtime: None,
            provider,
            container_id: Mutex::new(None),
        }
    }

    /// ID of the container backing the current (or most recent) run.
    pub fn container_id(&self) -> Option<String> {
        self.container_id.lock().clone()
    }

    fn set_container_id(&self, id: String) {
        *self.container_id.lock() = Some(id);
    }

    fn container_config(&self) -> ContainerConfig {
        ContainerConfig {
            image: self.image.clone(),
            cmd: shlex::split(self.command().trim()).unwrap_or_default(),
            entrypoint: self
                .entrypoint
                .as_deref()
                .and_then(|e| shlex::split(e.trim())),
            env: self.env.clone(),
            user: self.user.clone(),
            tty: self.tty,
            working_dir: None,
            labels: self.annotations.clone(),
            host: HostConfig {
                binds: self.volumes.clone(),
                volumes_from: self.volumes_from.clone(),
                network_mode: None,
            },
        }
    }

    async fn prepare_container(&self, ctx: &Arc<Context>) -> Result<(String, bool), JobError> {
        if let Some(existing) = &self.container {
            ctx.metrics.provider_operation("inspect_container");
            self.provider.inspect_container(existing).await?;
            return Ok((existing.clone(), false));
        }

        ctx.metrics.provider_operation("ensure_image");
        if let Err(err) = self.provider.ensure_image(&self.image, self.pull).await {
            ctx.metrics.provider_error("ensure_image");
            return Err(err.into());
        }

        let name = match &self.container_name {
            None => Some(self.name()),
            Some(name) if name.is_empty() => None,
            Some(name) => Some(name.as_str()),
        };
        ctx.metrics.provider_operation("create_container");
        let id = self
            .provider
            .create_container(&self.container_config(), name)
            .await?;

        if let Some(network) = self.network.as_deref().filter(|n| !n.is_empty()) {
            let networks = self.provider.find_networks_by_name(network).await?;
            let found = networks
                .first()
                .ok_or_else(|| ProviderError::NetworkNotFound {
                    name: network.to_string(),
                })?;
            ctx.metrics.provider_operation("connect_network");
            self.provider.connect_network(&found.id, &id).await?;
        }

        Ok((id, true))
    }

    /// Wait for the container to exit, preferring the event stream and
    /// falling back to polling when events are unavailable.
    async fn observe_exit(&self, ctx: &Arc<Context>, id: &str) -> Result<i64, JobError> {
        let filter = EventFilter {
            container_id: Some(id.to_string()),
        };
        let mut events = match self.provider.subscribe_events(filter).await {
            Ok(stream) => {
                ctx.metrics.container_monitor_method(true);
                stream
            }
            Err(err) => {
                tracing::debug!(container = id, error = %err, "event stream unavailable");
                ctx.metrics.container_monitor_method(false);
                ctx.metrics.container_monitor_fallback();
                return self.poll_exit(ctx, id).await;
            }
        };

        // The container may have exited before the subscription landed.
        if let Some(code) = exited_code(&self.provider.inspect_container(id).await?) {
            return Ok(code);
        }

        loop {
            match events.next().await {
                Some(Ok(event)) => {
                    ctx.metrics.container_event();
                    if event.action == "die" {
                        if let Some(code) = event.exit_code {
                            return Ok(code);
                        }
                        let state = self.provider.inspect_container(id).await?;
                        return Ok(state.exit_code.unwrap_or(-1));
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(container = id, error = %err, "event stream failed");
                    ctx.metrics.container_monitor_fallback();
                    return self.poll_exit(ctx, id).await;
                }
                None => {
                    ctx.metrics.container_monitor_fallback();
                    return self.poll_exit(ctx, id).await;
                }
            }
        }
    }

    async fn poll_exit(&self, ctx: &Arc<Context>, id: &str) -> Result<i64, JobError> {
        loop {
            let state = self.provider.inspect_container(id).await?;
            if let Some(code) = exited_code(&state) {
                return Ok(code);
            }
            ctx.clock.sleep(POLL_INTERVAL).await;
        }
    }

    async fn run_and_watch(&self, ctx: &Arc<Context>, id: &str) -> Result<(), JobError> {
        let started_at = ctx.clock.now();

        ctx.metrics.provider_operation("start_container");
        if let Err(err) = self.provider.start_container(id).await {
            ctx.metrics.provider_error("start_container");
            return Err(err.into());
        }

        let timeout: BoxFuture<'static, ()> = match self.max_runtime {
            Some(limit) => ctx.clock.sleep(limit),
            None => Box::pin(futures::future::pending()),
        };

        let exit_code = tokio::select! {
            code = self.observe_exit(ctx, id) => code?,
            _ = timeout => {
                let limit = self.max_runtime.unwrap_or_default();
                tracing::warn!(container = id, ?limit, "maximum runtime exceeded, stopping container");
                if let Err(err) = self.provider.stop_container(id, None).await {
                    tracing::warn!(container = id, error = %err, "failed to stop timed-out container");
                }
                return Err(JobError::MaxRuntimeExceeded { limit });
            }
            _ = ctx.cancel.cancelled() => {
                let _ = self.provider.stop_container(id, None).await;
                return Err(JobError::Canceled);
            }
        };

        let waited = (ctx.clock.now() - started_at).to_std().unwrap_or_default();
        ctx.metrics.container_wait_duration(waited);

        self.capture_logs(ctx, id, started_at).await;
        map_exit_code(exit_code)
    }

    async fn capture_logs(
        &self,
        ctx: &Arc<Context>,
        id: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) {
        let options = LogsOptions {
            since: Some(since),
            stdout: true,
            stderr: true,
        };
        match self.provider.container_logs(id, options).await {
            Ok(mut stream) => {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(chunk) => match chunk.kind {
                            LogStreamKind::Stdout => ctx.execution.output().write(&chunk.bytes),
                            LogStreamKind::Stderr => {
                                ctx.execution.error_output().write(&chunk.bytes)
                            }
                        },
                        Err(err) => {
                            tracing::warn!(container = id, error = %err, "log stream failed");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(container = id, error = %err, "failed to fetch container logs");
            }
        }
    }
}

fn exited_code(state: &ContainerState) -> Option<i64> {
    if state.running {
        None
    } else {
        state.exit_code.or(Some(-1))
    }
}

#[async_trait]
impl Job for RunJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    async fn run(&self, ctx: Arc<Context>) -> Result<(), JobError> {
        let (id, created) = self.prepare_container(&ctx).await?;
        self.set_container_id(id.clone());

        let result = self.run_and_watch(&ctx, &id).await;

        if self.delete && created {
            ctx.metrics.provider_operation("remove_container");
            if let Err(err) = self.provider.remove_container(&id, true).await {
                tracing::warn!(container = %id, error = %err, "failed to remove container");
                ctx.metrics.provider_error("remove_container");
            }
        }

        result
    }

    fn hash(&self) -> Result<String, JobError> {
        let mut hasher = FieldHasher::new();
        self.core.hash_into(&mut hasher);
        hasher.push_str("image", &self.image);
        hasher.push_opt_str("container", self.container.as_deref());
        hasher.push_opt_str("container_name", self.container_name.as_deref());
        hasher.push_bool("pull", self.pull);
        hasher.push_bool("delete", self.delete);
        hasher.push_opt_str("user", self.user.as_deref());
        hasher.push_bool("tty", self.tty);
        hasher.push_str_slice("env", &self.env);
        hasher.push_opt_str("entrypoint", self.entrypoint.as_deref());
        hasher.push_opt_str("network", self.network.as_deref());
        hasher.push_str_slice("volumes", &self.volumes);
        hasher.push_str_slice("volumes_from", &self.volumes_from);
        hasher.push_map("annotations", &self.annotations);
        hasher.push_duration("max_runtime", self.max_runtime.unwrap_or_default());
        Ok(hasher.finish())
    }

    fn validate(&self) -> Result<(), JobError> {
        if self.image.trim().is_empty() && self.container.is_none() {
            return Err(JobError::ImageOrContainerRequired);
        }
        Ok(())
    }
}
