//! Execution middleware.
//!
//! Middlewares wrap every run of the jobs they are installed on. A
//! middleware may short-circuit by returning without calling
//! [`Context::next`]. The set is de-duplicated by concrete type: installing
//! the same middleware type twice replaces the earlier registration in
//! place, so insertion order defines execution order.

use std::any::TypeId;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::execution::context::Context;
use crate::types::JobError;

/// Interceptor around job runs.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Run this link of the chain. Call `ctx.next()` to continue to the
    /// remaining middlewares and, finally, the job itself.
    async fn run(&self, ctx: Arc<Context>) -> Result<(), JobError>;

    /// Whether this middleware still runs for executions dispatched while
    /// the scheduler is stopping.
    fn continue_on_stop(&self) -> bool {
        false
    }
}

/// Ordered, type-deduplicated middleware container.
#[derive(Default, Clone)]
pub struct MiddlewareSet {
    entries: Vec<(TypeId, Arc<dyn Middleware>)>,
}

impl MiddlewareSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a middleware. A middleware of the same concrete type already
    /// present is replaced at its original position.
    pub fn add<M: Middleware>(&mut self, middleware: M) {
        let id = TypeId::of::<M>();
        let entry: Arc<dyn Middleware> = Arc::new(middleware);
        if let Some(existing) = self.entries.iter_mut().find(|(t, _)| *t == id) {
            existing.1 = entry;
        } else {
            self.entries.push((id, entry));
        }
    }

    /// Drop everything currently installed.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot for one execution. When `stopping` is set, only middlewares
    /// that continue on stop are included.
    pub fn snapshot(&self, stopping: bool) -> Vec<Arc<dyn Middleware>> {
        self.entries
            .iter()
            .map(|(_, m)| Arc::clone(m))
            .filter(|m| !stopping || m.continue_on_stop())
            .collect()
    }
}

impl std::fmt::Debug for MiddlewareSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareSet")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Writes a JSON report of every execution to a directory.
///
/// Failures to write are logged and never affect the run outcome.
pub struct SaveMiddleware {
    dir: PathBuf,
}

impl SaveMiddleware {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Middleware for SaveMiddleware {
    async fn run(&self, ctx: Arc<Context>) -> Result<(), JobError> {
        let result = ctx.clone().next().await;

        let report = ctx.execution.report(ctx.job.name());
        let path = self
            .dir
            .join(format!("{}_{}.json", report.job_name, report.execution_id));
        let mut report = report;
        match &result {
            Ok(()) => {}
            Err(JobError::Skipped) => report.skipped = true,
            Err(err) => {
                report.failed = true;
                report.error = Some(err.to_string());
            }
        }

        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&self.dir)?;
            let file = std::fs::File::create(&path)?;
            serde_json::to_writer_pretty(file, &report)?;
            Ok(())
        };
        if let Err(e) = write() {
            tracing::warn!(path = %path.display(), error = %e, "failed to save execution report");
        }

        result
    }

    fn continue_on_stop(&self) -> bool {
        true
    }
}
