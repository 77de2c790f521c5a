//! Exec-in-container job.

use std::sync::Arc;

use async_trait::async_trait;

use super::{map_exit_code, split_command, Job, JobCore};
use crate::execution::Context;
use crate::hash::FieldHasher;
use crate::provider::{ContainerProvider, ExecConfig};
use crate::types::JobError;

/// Runs the command inside an already-running container via the provider's
/// exec surface.
pub struct ExecJob {
    pub core: JobCore,
    /// Target container ID or name.
    pub container: String,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    provider: Arc<dyn ContainerProvider>,
}

impl ExecJob {
    pub fn new(core: JobCore, container: impl Into<String>, provider: Arc<dyn ContainerProvider>) -> Self {
        Self {
            core,
            container: container.into(),
            env: Vec::new(),
            working_dir: None,
            user: None,
            tty: false,
            provider,
        }
    }

    fn exec_config(&self) -> Result<ExecConfig, JobError> {
        Ok(ExecConfig {
            cmd: split_command(self.command())?,
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
            user: self.user.clone(),
            tty: self.tty,
            attach_stdout: true,
            attach_stderr: true,
        })
    }
}

#[async_trait]
impl Job for ExecJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    async fn run(&self, ctx: Arc<Context>) -> Result<(), JobError> {
        let config = self.exec_config()?;

        ctx.metrics.provider_operation("exec");
        let started = ctx.clock.now();

        let exec = tokio::select! {
            result = self.provider.run_exec(
                &self.container,
                &config,
                ctx.execution.output(),
                ctx.execution.error_output(),
            ) => result,
            _ = ctx.cancel.cancelled() => return Err(JobError::Canceled),
        };

        let elapsed = (ctx.clock.now() - started).to_std().unwrap_or_default();
        ctx.metrics.provider_latency("exec", elapsed);

        match exec {
            Ok(code) => map_exit_code(code),
            Err(err) => {
                ctx.metrics.provider_error("exec");
                Err(err.into())
            }
        }
    }

    fn hash(&self) -> Result<String, JobError> {
        let mut hasher = FieldHasher::new();
        self.core.hash_into(&mut hasher);
        hasher.push_str("container", &self.container);
        hasher.push_str_slice("env", &self.env);
        hasher.push_opt_str("working_dir", self.working_dir.as_deref());
        hasher.push_opt_str("user", self.user.as_deref());
        hasher.push_bool("tty", self.tty);
        Ok(hasher.finish())
    }

    fn validate(&self) -> Result<(), JobError> {
        if self.container.trim().is_empty() {
            return Err(JobError::ContainerRequired);
        }
        split_command(self.command()).map(|_| ())
    }
}
