//! Runtime configuration and the job-spec surface consumed by loaders.
//!
//! The scheduler itself is configured with [`SchedulerConfig`]; individual
//! jobs arrive from an external loader as [`JobSpec`] values carrying the
//! documented configuration keys. Building concrete job variants from a
//! spec is the loader's last step before `Scheduler::add_job`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::jobs::{ComposeJob, ExecJob, Job, JobCore, LocalJob, RunJob, RunServiceJob};
use crate::provider::ContainerProvider;
use crate::resilience::{ResilienceConfig, RetryPolicy};
use crate::scheduler::WorkflowConfig;
use crate::pool::PoolConfig;
use crate::types::JobError;

/// Top-level scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently executing jobs (normalized to ≥ 1).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_jobs: usize,
    /// Drain deadline used by `Scheduler::stop`.
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
    /// Period of the pool/memory stats emission.
    #[serde(with = "humantime_serde", default = "default_stats_interval")]
    pub stats_interval: Duration,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default = "WorkflowConfig::from_env")]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent(),
            shutdown_timeout: default_shutdown_timeout(),
            stats_interval: default_stats_interval(),
            pool: PoolConfig::default(),
            workflow: WorkflowConfig::from_env(),
            resilience: ResilienceConfig::default(),
        }
    }
}

/// Variant-specific job parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum JobKindSpec {
    /// Subprocess on the host.
    Local {
        #[serde(default)]
        environment: Vec<String>,
        #[serde(default)]
        working_dir: Option<String>,
    },
    /// Exec inside an existing container.
    Exec {
        container: String,
        #[serde(default)]
        environment: Vec<String>,
        #[serde(default)]
        working_dir: Option<String>,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        tty: bool,
    },
    /// Container launched from an image.
    Run {
        #[serde(default)]
        image: String,
        #[serde(default)]
        container: Option<String>,
        #[serde(default)]
        container_name: Option<String>,
        #[serde(default)]
        pull: bool,
        #[serde(default = "default_true")]
        delete: bool,
        #[serde(default)]
        environment: Vec<String>,
        #[serde(default)]
        entrypoint: Option<String>,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        tty: bool,
        #[serde(default)]
        network: Option<String>,
        #[serde(default)]
        volumes: Vec<String>,
        #[serde(default)]
        volumes_from: Vec<String>,
        #[serde(default)]
        annotations: BTreeMap<String, String>,
        /// Zero means no timeout.
        #[serde(with = "humantime_serde", default)]
        max_runtime: Duration,
    },
    /// One-shot swarm service.
    Service {
        image: String,
        #[serde(default = "default_true")]
        delete: bool,
        #[serde(default)]
        environment: Vec<String>,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        tty: bool,
        #[serde(default)]
        networks: Vec<String>,
        #[serde(default)]
        annotations: BTreeMap<String, String>,
        #[serde(with = "humantime_serde", default)]
        max_runtime: Duration,
    },
    /// `docker compose` invocation.
    Compose {
        service: String,
        #[serde(default)]
        file: Option<String>,
        #[serde(default)]
        exec: bool,
    },
}

fn default_true() -> bool {
    true
}

/// One job as described by the configuration loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobSpec {
    pub name: String,
    pub schedule: String,
    #[serde(default)]
    pub command: String,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub retry_exponential: bool,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub on_success: Vec<String>,
    #[serde(default)]
    pub on_failure: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_parallel: bool,
    #[serde(default)]
    pub run_on_startup: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub kind: JobKindSpec,
}

fn default_history_limit() -> usize {
    crate::jobs::DEFAULT_HISTORY_LIMIT
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

impl JobSpec {
    fn build_core(&self) -> JobCore {
        let mut core = JobCore::new(&self.name, &self.schedule, &self.command);
        core.history_limit = self.history_limit.max(1);
        core.retry = RetryPolicy {
            max_retries: self.max_retries,
            initial_delay_ms: self.retry_delay_ms,
            exponential: self.retry_exponential,
            max_delay_ms: self.retry_max_delay_ms,
            jitter: false,
        };
        core.dependencies = self.dependencies.clone();
        core.on_success = self.on_success.clone();
        core.on_failure = self.on_failure.clone();
        core.allow_parallel = self.allow_parallel;
        core.run_on_startup = self.run_on_startup;
        core
    }

    /// Materialize the concrete job variant. Container-backed variants
    /// need a provider; host variants ignore it.
    pub fn into_job(
        self,
        provider: Option<Arc<dyn ContainerProvider>>,
    ) -> Result<Arc<dyn Job>, JobError> {
        let core = self.build_core();
        let need_provider = || {
            provider.clone().ok_or_else(|| {
                JobError::Unexpected("container job requires a provider".to_string())
            })
        };

        let job: Arc<dyn Job> = match self.kind {
            JobKindSpec::Local {
                environment,
                working_dir,
            } => {
                let mut job = LocalJob::new(core);
                job.env = environment;
                job.working_dir = working_dir.map(Into::into);
                Arc::new(job)
            }
            JobKindSpec::Exec {
                container,
                environment,
                working_dir,
                user,
                tty,
            } => {
                let mut job = ExecJob::new(core, container, need_provider()?);
                job.env = environment;
                job.working_dir = working_dir;
                job.user = user;
                job.tty = tty;
                Arc::new(job)
            }
            JobKindSpec::Run {
                image,
                container,
                container_name,
                pull,
                delete,
                environment,
                entrypoint,
                user,
                tty,
                network,
                volumes,
                volumes_from,
                annotations,
                max_runtime,
            } => {
                let mut job = RunJob::new(core, image, need_provider()?);
                job.container = container;
                job.container_name = container_name;
                job.pull = pull;
                job.delete = delete;
                job.env = environment;
                job.entrypoint = entrypoint;
                job.user = user;
                job.tty = tty;
                job.network = network;
                job.volumes = volumes;
                job.volumes_from = volumes_from;
                job.annotations = annotations;
                job.max_runtime = (!max_runtime.is_zero()).then_some(max_runtime);
                Arc::new(job)
            }
            JobKindSpec::Service {
                image,
                delete,
                environment,
                user,
                tty,
                networks,
                annotations,
                max_runtime,
            } => {
                let mut job = RunServiceJob::new(core, image, need_provider()?);
                job.delete = delete;
                job.env = environment;
                job.user = user;
                job.tty = tty;
                job.networks = networks;
                job.labels = annotations;
                job.max_runtime = (!max_runtime.is_zero()).then_some(max_runtime);
                Arc::new(job)
            }
            JobKindSpec::Compose {
                service,
                file,
                exec,
            } => {
                let mut job = ComposeJob::new(core, service);
                job.file = file;
                job.exec = exec;
                Arc::new(job)
            }
        };

        job.validate()?;
        Ok(job)
    }
}
