//! tidecron runtime
//!
//! A container-native cron job scheduler: cron dispatch over heterogeneous
//! job variants (host subprocess, container exec, container run, swarm
//! service, compose), workflow DAGs, a resilience layer, bounded output
//! capture, and a pluggable metrics surface.

pub mod clock;
pub mod config;
pub mod execution;
pub mod hash;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod provider;
pub mod resilience;
pub mod scheduler;
pub mod shutdown;
pub mod types;

// Re-export the surface most embedders need.
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{JobKindSpec, JobSpec, SchedulerConfig};
pub use execution::{Context, Execution, ExecutionHandle, ExecutionReport, Middleware, MiddlewareSet, SaveMiddleware};
pub use hash::FieldHasher;
pub use jobs::{
    BareJob, ComposeJob, ExecJob, Job, JobCore, LocalJob, RunJob, RunServiceJob,
    DEFAULT_HISTORY_LIMIT,
};
pub use metrics::{LogRecorder, MemoryRecorder, MetricsRecorder, NullRecorder};
pub use pool::{BufferPool, PoolConfig, PoolStats, RingBuffer, SharedBuffer};
pub use provider::{
    ContainerConfig, ContainerProvider, ContainerState, EventFilter, ExecConfig, ExecStatus,
    HostConfig, LogChunk, LogStreamKind, LogsOptions, NetworkInfo, ProviderEvent, ServiceSpec,
    SystemInfo, TaskState, TaskStatus,
};
pub use resilience::{
    calculate_delay, Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    RateLimiter, RateLimiterConfig, ResilienceChain, ResilienceConfig, RetryExecutor, RetryPolicy,
};
pub use scheduler::{
    CronEngine, Schedule, ScheduleKind, Scheduler, SchedulerHealth, WorkflowConfig,
    WorkflowOrchestrator,
};
pub use shutdown::ShutdownManager;
pub use types::{
    CancelToken, DispatchOutcome, EntryId, JobError, JobResult, ProviderError, ResilienceError,
    RunState, ScheduleError, SchedulerError, ShutdownError, SkipReason, WorkflowError,
    WorkflowId, WorkflowStatus,
};
