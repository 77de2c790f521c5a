//! Job variants and their shared runtime state.
//!
//! A job is a named unit of work with a schedule and a command. Variants
//! differ in where the command runs: the local host, inside an existing
//! container, a fresh container, a swarm service, or a compose service.
//! Every variant carries a [`JobCore`] with the runtime bookkeeping the
//! scheduler relies on.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::execution::middleware::{Middleware, MiddlewareSet};
use crate::execution::{Context, ExecutionHandle};
use crate::hash::FieldHasher;
use crate::pool::SharedBuffer;
use crate::resilience::RetryPolicy;
use crate::types::JobError;

pub mod bare;
pub mod compose;
pub mod exec;
pub mod local;
pub mod run;
pub mod service;

#[cfg(test)]
pub mod test_support;

pub use bare::{BareAction, BareJob};
pub use compose::ComposeJob;
pub use exec::ExecJob;
pub use local::LocalJob;
pub use run::RunJob;
pub use service::RunServiceJob;

/// Default history ring length per job.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// A schedulable unit of work.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Shared runtime state.
    fn core(&self) -> &JobCore;

    /// Execute one run. The context carries the execution, streams, clock,
    /// and cancellation.
    async fn run(&self, ctx: Arc<Context>) -> Result<(), JobError>;

    /// Content hash over the fields that define this job's identity.
    fn hash(&self) -> Result<String, JobError>;

    /// Static validation, checked at registration time.
    fn validate(&self) -> Result<(), JobError>;

    fn name(&self) -> &str {
        &self.core().name
    }

    fn schedule(&self) -> &str {
        &self.core().schedule
    }

    fn command(&self) -> &str {
        &self.core().command
    }
}

/// Runtime state common to every job variant.
pub struct JobCore {
    pub name: String,
    pub schedule: String,
    pub command: String,
    pub history_limit: usize,
    pub retry: RetryPolicy,
    pub dependencies: Vec<String>,
    pub on_success: Vec<String>,
    pub on_failure: Vec<String>,
    pub allow_parallel: bool,
    pub run_on_startup: bool,
    running: AtomicU32,
    history: Mutex<VecDeque<ExecutionHandle>>,
    last_run: Mutex<Option<ExecutionHandle>>,
    middlewares: Mutex<MiddlewareSet>,
}

impl JobCore {
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            command: command.into(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            retry: RetryPolicy::default(),
            dependencies: Vec::new(),
            on_success: Vec::new(),
            on_failure: Vec::new(),
            allow_parallel: true,
            run_on_startup: false,
            running: AtomicU32::new(0),
            history: Mutex::new(VecDeque::new()),
            last_run: Mutex::new(None),
            middlewares: Mutex::new(MiddlewareSet::new()),
        }
    }

    /// Number of executions currently in flight.
    pub fn running(&self) -> u32 {
        self.running.load(Ordering::SeqCst)
    }

    pub fn notify_start(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    pub fn notify_stop(&self) {
        let _ = self
            .running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    /// Record a sealed execution in the history ring and as the last run.
    pub fn record_execution(&self, execution: ExecutionHandle) {
        *self.last_run.lock() = Some(execution.clone());
        let mut history = self.history.lock();
        history.push_back(execution);
        while history.len() > self.history_limit.max(1) {
            history.pop_front();
        }
    }

    pub fn history(&self) -> Vec<ExecutionHandle> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn last_run(&self) -> Option<ExecutionHandle> {
        self.last_run.lock().clone()
    }

    pub fn add_middleware<M: Middleware>(&self, middleware: M) {
        self.middlewares.lock().add(middleware);
    }

    /// Clear and install the given middleware set.
    pub fn reset_middlewares(&self, set: MiddlewareSet) {
        *self.middlewares.lock() = set;
    }

    pub fn middleware_snapshot(&self, stopping: bool) -> Vec<Arc<dyn Middleware>> {
        self.middlewares.lock().snapshot(stopping)
    }

    /// Hash the fields shared by every variant, in declaration order.
    pub fn hash_into(&self, hasher: &mut FieldHasher) {
        hasher.push_str("name", &self.name);
        hasher.push_str("schedule", &self.schedule);
        hasher.push_str("command", &self.command);
    }
}

impl std::fmt::Debug for JobCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCore")
            .field("name", &self.name)
            .field("schedule", &self.schedule)
            .field("command", &self.command)
            .field("running", &self.running())
            .finish()
    }
}

/// Map a runtime exit code onto the run outcome. `-1` is reserved for "no
/// normal termination observed".
pub fn map_exit_code(code: i64) -> Result<(), JobError> {
    match code {
        0 => Ok(()),
        -1 => Err(JobError::Unexpected(
            "no normal termination observed".to_string(),
        )),
        code => Err(JobError::NonZeroExit { code }),
    }
}

/// Split a command string into argv. Empty input is a validation error.
pub fn split_command(command: &str) -> Result<Vec<String>, JobError> {
    let argv = shlex::split(command.trim()).unwrap_or_default();
    if argv.is_empty() {
        return Err(JobError::EmptyCommand);
    }
    Ok(argv)
}

/// Run a subprocess with output wired into the execution streams, honoring
/// cancellation. Used by the local and compose variants.
pub(crate) async fn run_subprocess(
    ctx: &Arc<Context>,
    program: impl AsRef<OsStr>,
    args: &[String],
    extra_env: &[String],
    working_dir: Option<&Path>,
) -> Result<(), JobError> {
    let program = program.as_ref();
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    for pair in extra_env {
        if let Some((key, value)) = pair.split_once('=') {
            command.env(key, value);
        }
    }
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|e| {
        JobError::LocalRun(format!("spawn {}: {e}", program.to_string_lossy()))
    })?;

    let stdout_task = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(copy_stream(pipe, ctx.execution.output())));
    let stderr_task = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(copy_stream(pipe, ctx.execution.error_output())));

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = ctx.cancel.cancelled() => None,
    };
    let status = match waited {
        Some(status) => status.map_err(|e| JobError::LocalRun(format!("wait: {e}")))?,
        None => {
            let _ = child.start_kill();
            return Err(JobError::Canceled);
        }
    };

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(JobError::NonZeroExit { code: code as i64 }),
        None => Err(JobError::Unexpected("terminated by signal".to_string())),
    }
}

async fn copy_stream<R>(mut reader: R, sink: SharedBuffer)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.write(&chunk[..n]),
        }
    }
}
