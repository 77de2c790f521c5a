//! Swarm service run job: submit a one-shot service and poll its tasks to
//! a terminal state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::{map_exit_code, Job, JobCore};
use crate::execution::Context;
use crate::hash::FieldHasher;
use crate::provider::{normalize_image_reference, ContainerProvider, ServiceSpec, TaskStatus};
use crate::types::JobError;

/// Task-list poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct RunServiceJob {
    pub core: JobCore,
    pub image: String,
    /// Remove the service once it reaches a terminal state.
    pub delete: bool,
    pub user: Option<String>,
    pub tty: bool,
    pub env: Vec<String>,
    pub networks: Vec<String>,
    pub labels: BTreeMap<String, String>,
    /// Poll deadline. `None` means no timeout.
    pub max_runtime: Option<Duration>,
    provider: Arc<dyn ContainerProvider>,
}

impl RunServiceJob {
    pub fn new(
        core: JobCore,
        image: impl Into<String>,
        provider: Arc<dyn ContainerProvider>,
    ) -> Self {
        Self {
            core,
            image: image.into(),
            delete: true,
            user: None,
            tty: false,
            env: Vec::new(),
            networks: Vec::new(),
            labels: BTreeMap::new(),
            max_runtime: None,
            provider,
        }
    }

    fn service_spec(&self) -> ServiceSpec {
        ServiceSpec {
            name: self.core.name.clone(),
            image: normalize_image_reference(&self.image),
            command: shlex::split(self.command().trim()).unwrap_or_default(),
            env: self.env.clone(),
            user: self.user.clone(),
            tty: self.tty,
            networks: self.networks.clone(),
            labels: self.labels.clone(),
        }
    }

    async fn poll_terminal_task(
        &self,
        ctx: &Arc<Context>,
        service_id: &str,
    ) -> Result<TaskStatus, JobError> {
        let poll = async {
            loop {
                let tasks = self.provider.list_service_tasks(service_id).await?;
                if let Some(task) = tasks.iter().find(|t| t.state.is_terminal()) {
                    return Ok(task.clone());
                }
                ctx.clock.sleep(POLL_INTERVAL).await;
            }
        };

        let timeout: BoxFuture<'static, ()> = match self.max_runtime {
            Some(limit) => ctx.clock.sleep(limit),
            None => Box::pin(futures::future::pending()),
        };

        tokio::select! {
            result = poll => result,
            _ = timeout => Err(JobError::MaxRuntimeExceeded {
                limit: self.max_runtime.unwrap_or_default(),
            }),
            _ = ctx.cancel.cancelled() => Err(JobError::Canceled),
        }
    }
}

#[async_trait]
impl Job for RunServiceJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    async fn run(&self, ctx: Arc<Context>) -> Result<(), JobError> {
        self.validate()?;

        ctx.metrics.provider_operation("create_service");
        let service_id = match self.provider.create_service(&self.service_spec()).await {
            Ok(id) => id,
            Err(err) => {
                ctx.metrics.provider_error("create_service");
                return Err(err.into());
            }
        };

        let result = self.poll_terminal_task(&ctx, &service_id).await;

        if self.delete {
            ctx.metrics.provider_operation("remove_service");
            if let Err(err) = self.provider.remove_service(&service_id).await {
                tracing::warn!(service = %service_id, error = %err, "failed to remove service");
                ctx.metrics.provider_error("remove_service");
            }
        }

        let task = result?;
        map_exit_code(task.exit_code.unwrap_or(-1))
    }

    fn hash(&self) -> Result<String, JobError> {
        let mut hasher = FieldHasher::new();
        self.core.hash_into(&mut hasher);
        hasher.push_str("image", &self.image);
        hasher.push_bool("delete", self.delete);
        hasher.push_opt_str("user", self.user.as_deref());
        hasher.push_bool("tty", self.tty);
        hasher.push_str_slice("env", &self.env);
        hasher.push_str_slice("networks", &self.networks);
        hasher.push_map("labels", &self.labels);
        Ok(hasher.finish())
    }

    fn validate(&self) -> Result<(), JobError> {
        if self.image.trim().is_empty() {
            return Err(JobError::ImageRequired);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::test_support::test_context;
    use crate::provider::mock::MockProvider;
    use crate::provider::TaskState;

    fn task(state: TaskState, exit_code: Option<i64>) -> TaskStatus {
        TaskStatus {
            state,
            exit_code,
            message: String::new(),
        }
    }

    fn service_job(provider: Arc<MockProvider>) -> RunServiceJob {
        RunServiceJob::new(
            JobCore::new("svc", "@daily", "sync-data"),
            "worker",
            provider,
        )
    }

    #[tokio::test]
    async fn completes_when_task_reaches_complete() {
        let provider = Arc::new(MockProvider::new());
        provider.push_service_tasks(vec![task(TaskState::Running, None)]);
        provider.push_service_tasks(vec![task(TaskState::Complete, Some(0))]);

        let job = Arc::new(service_job(provider.clone()));
        job.run(test_context(job.clone())).await.unwrap();

        // Image is normalized with the default tag and the service removed.
        assert!(provider.removed_services().len() == 1);
    }

    #[tokio::test]
    async fn image_reference_is_normalized() {
        let provider = Arc::new(MockProvider::new());
        provider.push_service_tasks(vec![task(TaskState::Complete, Some(0))]);

        let mut job = service_job(provider.clone());
        job.delete = false;
        let job = Arc::new(job);
        job.run(test_context(job.clone())).await.unwrap();

        let services = provider.services();
        assert_eq!(services[0].image, "worker:latest");
        assert_eq!(services[0].command, vec!["sync-data"]);
    }

    #[tokio::test]
    async fn failed_task_exit_code_is_preserved() {
        let provider = Arc::new(MockProvider::new());
        provider.push_service_tasks(vec![task(TaskState::Failed, Some(9))]);

        let job = Arc::new(service_job(provider));
        let err = job.run(test_context(job.clone())).await.unwrap_err();
        assert!(matches!(err, JobError::NonZeroExit { code: 9 }));
    }

    #[tokio::test]
    async fn terminal_task_without_exit_code_is_unexpected() {
        let provider = Arc::new(MockProvider::new());
        provider.push_service_tasks(vec![task(TaskState::Rejected, None)]);

        let job = Arc::new(service_job(provider));
        let err = job.run(test_context(job.clone())).await.unwrap_err();
        assert!(matches!(err, JobError::Unexpected(_)));
    }

    #[tokio::test]
    async fn service_is_removed_even_on_failure() {
        let provider = Arc::new(MockProvider::new());
        provider.push_service_tasks(vec![task(TaskState::Failed, Some(1))]);

        let job = Arc::new(service_job(provider.clone()));
        let _ = job.run(test_context(job.clone())).await;
        assert_eq!(provider.removed_services().len(), 1);
    }

    #[test]
    fn validation_requires_an_image() {
        let provider = Arc::new(MockProvider::new());
        let job = RunServiceJob::new(JobCore::new("svc", "@daily", "x"), "  ", provider);
        assert!(matches!(job.validate(), Err(JobError::ImageRequired)));
    }
}
