//! Error types for the scheduler runtime.
//!
//! Every sentinel the system distinguishes is its own variant so callers can
//! match on identity instead of message text.

use std::time::Duration;
use thiserror::Error;

/// Schedule-expression parse failures, surfaced at `add_job` time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("schedule expression is empty")]
    Empty,

    #[error("invalid schedule expression {expr:?}: {reason}")]
    Parse { expr: String, reason: String },
}

/// Scheduler-level errors.
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("job already exists: {name}")]
    JobAlreadyExists { name: String },

    #[error("job not found: {name}")]
    JobNotFound { name: String },

    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("dependency not met for job {name}")]
    DependencyNotMet { name: String },

    #[error("cannot start job during shutdown")]
    ShuttingDown,

    #[error("timed out after {timeout:?} waiting for running jobs to drain")]
    WaitTimeout { timeout: Duration },

    #[error("job error: {0}")]
    Job(#[from] JobError),
}

/// Errors produced by a single job run.
#[derive(Error, Debug, Clone)]
pub enum JobError {
    #[error("command is empty")]
    EmptyCommand,

    #[error("image is required")]
    ImageRequired,

    #[error("either image or container must be set")]
    ImageOrContainerRequired,

    #[error("container is required")]
    ContainerRequired,

    #[error("service is required")]
    ServiceRequired,

    #[error("unsupported field type for hashing: {field}")]
    UnsupportedFieldType { field: String },

    #[error("command not found: {command}")]
    CommandNotFound { command: String },

    #[error("maximum runtime exceeded after {limit:?}")]
    MaxRuntimeExceeded { limit: Duration },

    #[error("exit code {code}")]
    NonZeroExit { code: i64 },

    #[error("unexpected termination: {0}")]
    Unexpected(String),

    /// Sentinel: the run was deliberately skipped. Not a failure.
    #[error("execution skipped")]
    Skipped,

    #[error("job canceled")]
    Canceled,

    #[error("local run: {0}")]
    LocalRun(String),

    #[error("job failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        source: Box<JobError>,
    },

    #[error("resilience: {0}")]
    Resilience(#[from] ResilienceError),

    #[error("provider: {0}")]
    Provider(#[from] ProviderError),

    #[error("workflow: {0}")]
    Workflow(#[from] WorkflowError),
}

impl JobError {
    /// Exit code associated with this failure, `-1` when no normal
    /// termination was observed.
    pub fn exit_code(&self) -> i64 {
        match self {
            JobError::NonZeroExit { code } => *code,
            JobError::RetriesExhausted { source, .. } => source.exit_code(),
            _ => -1,
        }
    }

    /// Whether a retry executor should consider another attempt. Fast-fail
    /// sentinels from the resilience layer, skips, and cancellation are
    /// final; provider errors consult their own classification.
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Skipped | JobError::Canceled => false,
            JobError::Resilience(ResilienceError::CircuitOpen)
            | JobError::Resilience(ResilienceError::CircuitHalfOpenFull)
            | JobError::Resilience(ResilienceError::BulkheadFull { .. }) => false,
            JobError::Resilience(ResilienceError::RateLimitExceeded) => true,
            JobError::Resilience(ResilienceError::TokensExceedCapacity { .. }) => false,
            JobError::EmptyCommand
            | JobError::ImageRequired
            | JobError::ImageOrContainerRequired
            | JobError::ContainerRequired
            | JobError::ServiceRequired
            | JobError::UnsupportedFieldType { .. }
            | JobError::CommandNotFound { .. }
            | JobError::RetriesExhausted { .. } => false,
            JobError::Provider(e) => e.is_retryable(),
            _ => true,
        }
    }
}

/// Workflow/DAG errors.
#[derive(Error, Debug, Clone)]
pub enum WorkflowError {
    #[error("circular dependency involving job {name}")]
    CircularDependency { name: String },

    #[error("invalid workflow: {reason}")]
    Invalid { reason: String },

    #[error("dependency not met for job {name}")]
    DependencyNotMet { name: String },
}

/// Fast-fail sentinels from the resilience layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("circuit breaker half-open probe limit reached")]
    CircuitHalfOpenFull,

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("requested {requested} tokens exceeds bucket capacity {capacity}")]
    TokensExceedCapacity { requested: u64, capacity: u64 },

    #[error("bulkhead {name} is full")]
    BulkheadFull { name: String },
}

/// Graceful-shutdown errors.
#[derive(Error, Debug, Clone)]
pub enum ShutdownError {
    #[error("shutdown already in progress")]
    InProgress,

    #[error("shutdown timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("{failed} shutdown hook(s) failed: {details}")]
    HookFailures { failed: usize, details: String },
}

/// Errors from the container-provider surface. Implementations wrap daemon
/// failures with the operation and the resource identifier involved.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("container not found: {id}")]
    ContainerNotFound { id: String },

    #[error("image not found locally: {reference}")]
    LocalImageNotFound { reference: String },

    #[error("service not found: {id}")]
    ServiceNotFound { id: String },

    #[error("network not found: {name}")]
    NetworkNotFound { name: String },

    #[error("container start failed for {id}: {reason}")]
    ContainerStartFailed { id: String, reason: String },

    #[error("image pull failed for {reference}: {reason}")]
    ImagePullFailed { reference: String, reason: String },

    #[error("service start failed for {id}: {reason}")]
    ServiceStartFailed { id: String, reason: String },

    #[error("{op} {resource}: {reason}")]
    Operation {
        op: &'static str,
        resource: String,
        reason: String,
    },
}

/// Transient-failure markers matched case-insensitively against provider
/// error text.
const RETRYABLE_SUBSTRINGS: &[&str] = &[
    "connection refused",
    "connection reset",
    "timeout",
    "temporary failure",
    "no such host",
    "network is unreachable",
    "network unreachable",
];

impl ProviderError {
    /// Wrap a daemon failure with operation + resource context.
    pub fn operation(
        op: &'static str,
        resource: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        ProviderError::Operation {
            op,
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the failure looks transient enough to retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::ContainerStartFailed { .. }
            | ProviderError::ImagePullFailed { .. }
            | ProviderError::ServiceStartFailed { .. } => true,
            ProviderError::ContainerNotFound { .. }
            | ProviderError::LocalImageNotFound { .. }
            | ProviderError::ServiceNotFound { .. }
            | ProviderError::NetworkNotFound { .. } => false,
            ProviderError::Operation { reason, .. } => {
                let lower = reason.to_lowercase();
                RETRYABLE_SUBSTRINGS.iter().any(|s| lower.contains(s))
            }
        }
    }
}
