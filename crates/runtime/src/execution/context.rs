//! Per-run context threaded through the middleware chain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::clock::Clock;
use crate::execution::middleware::Middleware;
use crate::execution::ExecutionHandle;
use crate::jobs::Job;
use crate::metrics::MetricsRecorder;
use crate::types::{CancelToken, JobError, WorkflowId};

/// Terminal action invoked once the middleware chain is exhausted. The
/// scheduler installs the resilience-wrapped job run here; the default is
/// the bare run.
pub type TerminalAction =
    Arc<dyn Fn(Arc<Context>) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;

/// Carries one execution through the ordered interceptor chain and into the
/// job's run.
pub struct Context {
    pub job: Arc<dyn Job>,
    pub execution: ExecutionHandle,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<dyn MetricsRecorder>,
    pub cancel: CancelToken,
    pub workflow: Option<WorkflowId>,
    /// When set, the completion of this run advances the workflow DAG.
    pub propagate_dependencies: bool,
    middlewares: Vec<Arc<dyn Middleware>>,
    cursor: AtomicUsize,
    terminal: TerminalAction,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job: Arc<dyn Job>,
        execution: ExecutionHandle,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsRecorder>,
        cancel: CancelToken,
        middlewares: Vec<Arc<dyn Middleware>>,
        workflow: Option<WorkflowId>,
        terminal: Option<TerminalAction>,
    ) -> Arc<Self> {
        let terminal = terminal.unwrap_or_else(|| {
            Arc::new(
                |ctx: Arc<Context>| -> BoxFuture<'static, Result<(), JobError>> {
                    let job = Arc::clone(&ctx.job);
                    Box::pin(async move { job.run(ctx).await })
                },
            )
        });
        Arc::new(Self {
            job,
            execution,
            clock,
            metrics,
            cancel,
            workflow,
            propagate_dependencies: workflow.is_some(),
            middlewares,
            cursor: AtomicUsize::new(0),
            terminal,
        })
    }

    /// Mark the execution as started.
    pub fn start(&self) {
        self.execution.start(self.clock.now());
    }

    /// Seal the execution with the given outcome.
    pub fn stop(&self, result: Result<(), JobError>) {
        self.execution.stop(self.clock.now(), result);
    }

    /// Advance to the next middleware, or the terminal action once the
    /// chain is exhausted. A middleware that returns without calling this
    /// short-circuits the rest of the chain.
    pub fn next(self: Arc<Self>) -> BoxFuture<'static, Result<(), JobError>> {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        if index < self.middlewares.len() {
            let middleware = Arc::clone(&self.middlewares[index]);
            Box::pin(async move { middleware.run(self).await })
        } else {
            (self.terminal.clone())(self)
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("job", &self.job.name())
            .field("execution", &self.execution.id())
            .field("workflow", &self.workflow)
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}
