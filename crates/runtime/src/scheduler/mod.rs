//! The scheduler: cron dispatch, job lifecycle, concurrency gating,
//! workflow orchestration, and graceful stop.
//!
//! Jobs are registered into the active set and mirrored into the cron
//! engine. Fires arrive on the engine's channel; the dispatcher task spawns
//! one worker per fire, and each worker walks the dispatch pipeline:
//! shutdown gate → dependency gate → overlap gate → concurrency gate →
//! middleware chain → resilience-wrapped run → bookkeeping.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::execution::context::TerminalAction;
use crate::execution::{Context, Execution, ExecutionHandle};
use crate::jobs::Job;
use crate::metrics::MetricsRecorder;
use crate::pool::BufferPool;
use crate::resilience::{Attempt, ResilienceChain, RetryExecutor};
use crate::types::{
    CancelToken, DispatchOutcome, EntryId, JobError, JobResult, RunState, SchedulerError,
    SkipReason, WorkflowId,
};

pub mod cron_engine;
pub mod workflow;

pub use cron_engine::{CronEngine, Fire, Schedule, ScheduleKind};
pub use workflow::{WorkflowConfig, WorkflowExecution, WorkflowOrchestrator};

type CompletionCallback = Box<dyn Fn(&str, bool) + Send + Sync>;

/// Serializable scheduler health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerHealth {
    pub state: RunState,
    pub active_jobs: usize,
    pub disabled_jobs: usize,
    pub removed_jobs: usize,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub workflow_executions: usize,
}

/// Non-blocking concurrency gate. Capacity changes apply to future
/// acquisitions only.
struct ConcurrencyGate {
    max: AtomicUsize,
    in_flight: AtomicUsize,
}

impl ConcurrencyGate {
    fn new(max: usize) -> Self {
        Self {
            max: AtomicUsize::new(max.max(1)),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn try_acquire(&self) -> bool {
        let max = self.max.load(Ordering::SeqCst);
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < max).then_some(current + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    fn set_max(&self, max: usize) {
        self.max.store(max.max(1), Ordering::SeqCst);
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct JobTables {
    active: Vec<Arc<dyn Job>>,
    disabled: Vec<Arc<dyn Job>>,
    removed: Vec<Arc<dyn Job>>,
    /// Tag → job names, insertion-ordered.
    tags: HashMap<String, Vec<String>>,
    /// Active job name → cron entry.
    entries: HashMap<String, EntryId>,
}

impl JobTables {
    fn find_active(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.active.iter().find(|j| j.name() == name).cloned()
    }

    fn find_disabled(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.disabled.iter().find(|j| j.name() == name).cloned()
    }
}

struct SchedulerInner {
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsRecorder>,
    pool: Arc<BufferPool>,
    engine: Arc<CronEngine>,
    workflows: Arc<WorkflowOrchestrator>,
    resilience: ResilienceChain,
    retry: RetryExecutor,
    tables: Mutex<JobTables>,
    run_state: RwLock<RunState>,
    gate: ConcurrencyGate,
    workers: AtomicUsize,
    drained: Notify,
    cancel: CancelToken,
    dispatcher_started: AtomicBool,
    stats_running: AtomicBool,
    stats_shutdown: Notify,
    stats_interval: Duration,
    shutdown_timeout: Duration,
    on_complete: Mutex<Option<CompletionCallback>>,
}

/// The cron-style job scheduler.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        let pool = BufferPool::new(config.pool.clone());
        let engine = CronEngine::new(Arc::clone(&clock));
        let workflows = WorkflowOrchestrator::new(
            Arc::clone(&clock),
            Arc::clone(&metrics),
            config.workflow.clone(),
        );
        let resilience = ResilienceChain::new(&config.resilience, Arc::clone(&clock));
        let retry = RetryExecutor::new(Arc::clone(&clock), Arc::clone(&metrics));

        Self {
            inner: Arc::new(SchedulerInner {
                clock,
                metrics,
                pool,
                engine,
                workflows,
                resilience,
                retry,
                tables: Mutex::new(JobTables::default()),
                run_state: RwLock::new(RunState::Stopped),
                gate: ConcurrencyGate::new(config.max_concurrent_jobs),
                workers: AtomicUsize::new(0),
                drained: Notify::new(),
                cancel: CancelToken::new(),
                dispatcher_started: AtomicBool::new(false),
                stats_running: AtomicBool::new(false),
                stats_shutdown: Notify::new(),
                stats_interval: config.stats_interval,
                shutdown_timeout: config.shutdown_timeout,
                on_complete: Mutex::new(None),
            }),
        }
    }

    // ── Registration ────────────────────────────────────────────────

    /// Register a job. Validates the schedule and the job itself, rejects
    /// name collisions against the active set, and registers a cron entry.
    /// Works whether or not the scheduler is running.
    pub fn add_job(&self, job: Arc<dyn Job>) -> Result<(), SchedulerError> {
        let schedule = Schedule::parse(job.schedule())?;
        job.validate()?;

        let mut tables = self.inner.tables.lock();
        if tables.find_active(job.name()).is_some() {
            return Err(SchedulerError::JobAlreadyExists {
                name: job.name().to_string(),
            });
        }

        let entry = self.inner.engine.add(job.name(), schedule);
        tables.entries.insert(job.name().to_string(), entry);
        tables.active.push(Arc::clone(&job));
        self.inner.metrics.job_scheduled(job.name());
        tracing::info!(job = job.name(), schedule = job.schedule(), "job added");
        Ok(())
    }

    /// `add_job` plus tag-index entries.
    pub fn add_job_with_tags(
        &self,
        job: Arc<dyn Job>,
        tags: &[String],
    ) -> Result<(), SchedulerError> {
        let name = job.name().to_string();
        self.add_job(job)?;
        let mut tables = self.inner.tables.lock();
        for tag in tags {
            let names = tables.tags.entry(tag.clone()).or_default();
            if !names.contains(&name) {
                names.push(name.clone());
            }
        }
        Ok(())
    }

    /// Remove a job from the active set. Missing jobs are a no-op.
    pub fn remove_job(&self, name: &str) {
        let mut tables = self.inner.tables.lock();
        self.remove_locked(&mut tables, name);
    }

    fn remove_locked(&self, tables: &mut JobTables, name: &str) -> bool {
        let Some(index) = tables.active.iter().position(|j| j.name() == name) else {
            return false;
        };
        let job = tables.active.remove(index);
        if let Some(entry) = tables.entries.remove(name) {
            self.inner.engine.remove(entry);
        }
        for names in tables.tags.values_mut() {
            names.retain(|n| n != name);
        }
        tables.removed.push(job);
        tracing::info!(job = name, "job removed");
        true
    }

    /// Remove every job carrying `tag`, in insertion order. Returns the
    /// number removed.
    pub fn remove_jobs_by_tag(&self, tag: &str) -> usize {
        let mut tables = self.inner.tables.lock();
        let names = tables.tags.get(tag).cloned().unwrap_or_default();
        let mut removed = 0;
        for name in names {
            if self.remove_locked(&mut tables, &name) {
                removed += 1;
            }
        }
        tables.tags.remove(tag);
        removed
    }

    /// Move a job from active to disabled; its cron entry is dropped but
    /// history is retained for re-enablement.
    pub fn disable_job(&self, name: &str) -> Result<(), SchedulerError> {
        let mut tables = self.inner.tables.lock();
        let Some(index) = tables.active.iter().position(|j| j.name() == name) else {
            return Err(SchedulerError::JobNotFound {
                name: name.to_string(),
            });
        };
        let job = tables.active.remove(index);
        if let Some(entry) = tables.entries.remove(name) {
            self.inner.engine.remove(entry);
        }
        tables.disabled.push(job);
        tracing::info!(job = name, "job disabled");
        Ok(())
    }

    /// Move a job back from disabled to active and re-register its entry.
    pub fn enable_job(&self, name: &str) -> Result<(), SchedulerError> {
        let mut tables = self.inner.tables.lock();
        let Some(index) = tables.disabled.iter().position(|j| j.name() == name) else {
            return Err(SchedulerError::JobNotFound {
                name: name.to_string(),
            });
        };
        let job = tables.disabled.remove(index);
        let schedule = Schedule::parse(job.schedule())?;
        let entry = self.inner.engine.add(job.name(), schedule);
        tables.entries.insert(name.to_string(), entry);
        tables.active.push(job);
        tracing::info!(job = name, "job enabled");
        Ok(())
    }

    /// Atomically replace a job: the old cron entry is dropped, the new
    /// job (with its own schedule) takes the old one's position.
    pub fn update_job(&self, name: &str, new_job: Arc<dyn Job>) -> Result<(), SchedulerError> {
        let schedule = Schedule::parse(new_job.schedule())?;
        new_job.validate()?;

        let mut tables = self.inner.tables.lock();
        let Some(index) = tables.active.iter().position(|j| j.name() == name) else {
            return Err(SchedulerError::JobNotFound {
                name: name.to_string(),
            });
        };
        if let Some(entry) = tables.entries.remove(name) {
            self.inner.engine.remove(entry);
        }
        let entry = self.inner.engine.add(new_job.name(), schedule);
        tables.entries.insert(new_job.name().to_string(), entry);
        tables.active[index] = new_job;
        tracing::info!(job = name, "job updated");
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Active jobs in insertion order.
    pub fn entries(&self) -> Vec<Arc<dyn Job>> {
        self.inner.tables.lock().active.clone()
    }

    pub fn get_job(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.inner.tables.lock().find_active(name)
    }

    pub fn get_disabled_job(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.inner.tables.lock().find_disabled(name)
    }

    pub fn get_removed_jobs(&self) -> Vec<Arc<dyn Job>> {
        self.inner.tables.lock().removed.clone()
    }

    pub fn get_jobs_by_tag(&self, tag: &str) -> Vec<Arc<dyn Job>> {
        let tables = self.inner.tables.lock();
        tables
            .tags
            .get(tag)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| tables.find_active(name))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_job_running(&self, name: &str) -> bool {
        self.get_job(name)
            .map(|job| job.core().running() > 0)
            .unwrap_or(false)
    }

    pub fn is_running(&self) -> bool {
        *self.inner.run_state.read() == RunState::Running
    }

    pub fn run_state(&self) -> RunState {
        *self.inner.run_state.read()
    }

    pub fn health(&self) -> SchedulerHealth {
        let tables = self.inner.tables.lock();
        SchedulerHealth {
            state: *self.inner.run_state.read(),
            active_jobs: tables.active.len(),
            disabled_jobs: tables.disabled.len(),
            removed_jobs: tables.removed.len(),
            in_flight: self.inner.gate.in_flight(),
            max_concurrent: self.inner.gate.max(),
            workflow_executions: self.inner.workflows.len(),
        }
    }

    pub fn workflows(&self) -> &Arc<WorkflowOrchestrator> {
        &self.inner.workflows
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.inner.pool
    }

    // ── Tuning & callbacks ──────────────────────────────────────────

    /// Resize the concurrency gate; values below 1 are normalized to 1.
    /// The new capacity applies to future acquisitions only.
    pub fn set_max_concurrent_jobs(&self, max: usize) {
        self.inner.gate.set_max(max);
    }

    /// Install a callback invoked with `(job name, success)` after every
    /// execution.
    pub fn set_on_job_complete<F>(&self, callback: F)
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        *self.inner.on_complete.lock() = Some(Box::new(callback));
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Transition Stopped → Running: start the cron engine, the dispatcher,
    /// the workflow cleanup ticker, and fire run-on-startup jobs once.
    /// Starting an already-running scheduler is a no-op.
    pub fn start(&self) {
        {
            let mut state = self.inner.run_state.write();
            if *state != RunState::Stopped {
                return;
            }
            *state = RunState::Starting;
        }

        self.inner.engine.start();
        self.inner.workflows.start_cleanup();
        self.inner.pool.start_maintenance(Arc::clone(&self.inner.clock));

        if !self.inner.dispatcher_started.swap(true, Ordering::SeqCst) {
            if let Some(mut fires) = self.inner.engine.take_fires() {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    while let Some(fire) = fires.recv().await {
                        inner.dispatch_fire(fire);
                    }
                    tracing::debug!("dispatcher exited: fire channel closed");
                });
            }
        }

        self.inner.start_stats_loop();

        *self.inner.run_state.write() = RunState::Running;
        tracing::info!("scheduler started");

        let startup_jobs: Vec<Arc<dyn Job>> = {
            let tables = self.inner.tables.lock();
            tables
                .active
                .iter()
                .filter(|job| {
                    job.core().run_on_startup
                        || Schedule::parse(job.schedule())
                            .map(|s| s.runs_on_startup())
                            .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        for job in startup_jobs {
            tracing::debug!(job = job.name(), "dispatching run-on-startup job");
            self.inner.spawn_worker(job, None);
        }
    }

    /// Stop with the configured drain timeout.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        self.stop_with_timeout(self.inner.shutdown_timeout).await
    }

    /// Transition Running → Stopping, cease cron ticks, and wait for
    /// in-flight executions to drain. On deadline expiry the root context
    /// is cancelled, workers are left to finish on their own, and
    /// `WaitTimeout` is returned. Stopping an already-stopped scheduler is
    /// a no-op.
    pub async fn stop_with_timeout(&self, timeout: Duration) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.run_state.write();
            match *state {
                RunState::Running => *state = RunState::Stopping,
                _ => return Ok(()),
            }
        }
        tracing::info!("scheduler stopping");

        self.inner.engine.stop();
        self.inner.workflows.stop_cleanup();
        self.inner.pool.stop_maintenance();
        self.inner.stats_shutdown.notify_waiters();
        self.inner.stats_running.store(false, Ordering::SeqCst);

        let mut deadline = self.inner.clock.sleep(timeout);
        let result = loop {
            let notified = self.inner.drained.notified();
            if self.inner.workers.load(Ordering::SeqCst) == 0 {
                break Ok(());
            }
            tokio::select! {
                _ = notified => {}
                _ = &mut deadline => {
                    self.inner.cancel.cancel();
                    break Err(SchedulerError::WaitTimeout { timeout });
                }
            }
        };

        *self.inner.run_state.write() = RunState::Stopped;
        tracing::info!("scheduler stopped");
        result
    }

    /// Dispatch one execution of `name` immediately, bypassing the cron
    /// tick but honoring the dependency gate, overlap policy, and the
    /// concurrency gate.
    pub async fn run_job(&self, name: &str) -> Result<(), SchedulerError> {
        let job = self
            .get_job(name)
            .ok_or_else(|| SchedulerError::JobNotFound {
                name: name.to_string(),
            })?;

        let inner = Arc::clone(&self.inner);
        inner.workers.fetch_add(1, Ordering::SeqCst);
        let (outcome, error) = inner.dispatch(job, None).await;
        if inner.workers.fetch_sub(1, Ordering::SeqCst) == 1 {
            inner.drained.notify_waiters();
        }

        match outcome {
            DispatchOutcome::RanSuccess => Ok(()),
            DispatchOutcome::RanFailure => Err(SchedulerError::Job(
                error.unwrap_or(JobError::Unexpected("run failed".to_string())),
            )),
            DispatchOutcome::Skipped(SkipReason::Dependency) => {
                Err(SchedulerError::DependencyNotMet {
                    name: name.to_string(),
                })
            }
            DispatchOutcome::Skipped(SkipReason::Shutdown) => Err(SchedulerError::ShuttingDown),
            DispatchOutcome::Skipped(_) => Ok(()),
        }
    }
}

impl SchedulerInner {
    /// Route one cron fire to a worker. Stale fires (entry no longer
    /// current) are dropped; fires for disabled jobs count a skip.
    fn dispatch_fire(self: &Arc<Self>, fire: Fire) {
        let job = {
            let tables = self.tables.lock();
            match tables.entries.get(&fire.job) {
                Some(entry) if *entry == fire.entry => tables.find_active(&fire.job),
                _ => {
                    if tables.find_disabled(&fire.job).is_some() {
                        self.metrics.job_skipped(&fire.job, SkipReason::Disabled);
                    }
                    None
                }
            }
        };
        if let Some(job) = job {
            self.spawn_worker(job, None);
        }
    }

    fn spawn_worker(self: &Arc<Self>, job: Arc<dyn Job>, workflow: Option<WorkflowId>) {
        self.workers.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _ = inner.dispatch(job, workflow).await;
            if inner.workers.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.drained.notify_waiters();
            }
        });
    }

    /// The dispatch pipeline for one fire of one job.
    async fn dispatch(
        self: &Arc<Self>,
        job: Arc<dyn Job>,
        workflow: Option<WorkflowId>,
    ) -> (DispatchOutcome, Option<JobError>) {
        let name = job.name().to_string();

        // 1. Shutdown gate.
        let stopping = {
            let state = *self.run_state.read();
            matches!(state, RunState::Stopping | RunState::Stopped)
        };
        if stopping {
            self.metrics.job_skipped(&name, SkipReason::Shutdown);
            if let Some(wf) = workflow {
                self.workflows.record_result(wf, &name, JobResult::Skipped);
            }
            return (DispatchOutcome::Skipped(SkipReason::Shutdown), None);
        }

        // 2. Dependency gate.
        if !self
            .workflows
            .can_execute(workflow, &job.core().dependencies)
        {
            self.metrics.job_skipped(&name, SkipReason::Dependency);
            return (DispatchOutcome::Skipped(SkipReason::Dependency), None);
        }

        // 3. Overlap gate.
        if !job.core().allow_parallel && job.core().running() > 0 {
            self.metrics.job_skipped(&name, SkipReason::Overlap);
            if let Some(wf) = workflow {
                self.workflows.record_result(wf, &name, JobResult::Skipped);
            }
            return (DispatchOutcome::Skipped(SkipReason::Overlap), None);
        }

        // 4. Concurrency gate.
        if !self.gate.try_acquire() {
            self.metrics.job_skipped(&name, SkipReason::Capacity);
            if let Some(wf) = workflow {
                self.workflows.record_result(wf, &name, JobResult::Skipped);
            }
            return (DispatchOutcome::Skipped(SkipReason::Capacity), None);
        }

        // A root fire of a job with dependents opens a workflow execution.
        let workflow = workflow.or_else(|| self.maybe_begin_workflow(&job));
        if let Some(wf) = workflow {
            self.workflows.mark_running(wf, &name);
        }

        // 5. Execution, context, streams.
        let execution = ExecutionHandle::new(Execution::new(self.pool.get(), self.pool.get()));
        job.core().notify_start();
        self.metrics.job_started(&name);
        self.metrics.concurrent_jobs(self.gate.in_flight());

        let ctx = Context::new(
            Arc::clone(&job),
            execution.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.metrics),
            self.cancel.clone(),
            job.core().middleware_snapshot(false),
            workflow,
            Some(self.terminal_action()),
        );

        // 6. Run the chain.
        ctx.start();
        let result = ctx.clone().next().await;
        ctx.stop(result.clone());

        // 7. Seal, record, release.
        job.core().record_execution(execution.clone());
        let (out, err) = execution.reclaim_buffers();
        self.pool.put(out);
        self.pool.put(err);
        self.gate.release();
        job.core().notify_stop();

        let success = matches!(result, Ok(()) | Err(JobError::Skipped));
        self.metrics
            .job_completed(&name, execution.duration(), success);
        if let Some(callback) = self.on_complete.lock().as_ref() {
            callback(&name, success);
        }

        let job_result = match &result {
            Ok(()) => JobResult::Success,
            Err(JobError::Skipped) => JobResult::Skipped,
            Err(_) => JobResult::Failure,
        };
        match &result {
            Ok(()) => tracing::info!(job = %name, "job finished"),
            Err(JobError::Skipped) => tracing::info!(job = %name, "job skipped itself"),
            Err(error) => tracing::warn!(job = %name, %error, "job failed"),
        }

        // 8. Advance the workflow DAG.
        if let Some(wf) = workflow {
            self.workflows.record_result(wf, &name, job_result);
            self.trigger_followers(wf, &job, job_result);
        }

        match result {
            Ok(()) | Err(JobError::Skipped) => (DispatchOutcome::RanSuccess, None),
            Err(error) => (DispatchOutcome::RanFailure, Some(error)),
        }
    }

    /// Periodically publish pool stats, in-flight count, and process
    /// memory to the metrics recorder.
    fn start_stats_loop(self: &Arc<Self>) {
        if self.stats_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let pid = sysinfo::Pid::from_u32(std::process::id());
            let mut system = sysinfo::System::new();
            loop {
                tokio::select! {
                    _ = inner.clock.sleep(inner.stats_interval) => {
                        if !inner.stats_running.load(Ordering::SeqCst) {
                            break;
                        }
                        inner.metrics.pool_stats(&inner.pool.stats());
                        inner.metrics.concurrent_jobs(inner.gate.in_flight());
                        system.refresh_process_specifics(
                            pid,
                            sysinfo::ProcessRefreshKind::new().with_memory(),
                        );
                        if let Some(process) = system.process(pid) {
                            inner.metrics.memory_usage(process.memory());
                        }
                    }
                    _ = inner.stats_shutdown.notified() => break,
                }
            }
        });
    }

    /// The terminal action installed at the end of every middleware chain:
    /// the job's run, wrapped by the resilience stack and the retry
    /// executor, with panics contained to the execution.
    fn terminal_action(self: &Arc<Self>) -> TerminalAction {
        let inner = Arc::clone(self);
        Arc::new(
            move |ctx: Arc<Context>| -> BoxFuture<'static, Result<(), JobError>> {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    let policy = ctx.job.core().retry.clone();
                    let cancel = ctx.cancel.clone();
                    let name = ctx.job.name().to_string();

                    let attempt_inner = Arc::clone(&inner);
                    let attempt_ctx = Arc::clone(&ctx);
                    let action: Attempt<'static> = Box::new(
                        move || -> BoxFuture<'static, Result<(), JobError>> {
                            let inner = Arc::clone(&attempt_inner);
                            let ctx = Arc::clone(&attempt_ctx);
                            Box::pin(async move {
                                inner
                                    .resilience
                                    .run_attempt(Box::pin(run_contained(ctx)))
                                    .await
                            })
                        },
                    );

                    inner.retry.execute(&name, &policy, &cancel, action).await
                })
            },
        )
    }

    /// When a fire lands outside any workflow and the job has dependents
    /// or completion triggers, open a workflow execution covering its
    /// transitive closure.
    fn maybe_begin_workflow(self: &Arc<Self>, job: &Arc<dyn Job>) -> Option<WorkflowId> {
        let members = {
            let tables = self.tables.lock();
            workflow_closure(&tables.active, job.name())
        };
        if members.len() <= 1 {
            return None;
        }
        Some(self.workflows.begin(job.name(), members))
    }

    /// After a run inside a workflow: dispatch members whose dependencies
    /// are now satisfied, plus the completing job's on-success/on-failure
    /// triggers.
    fn trigger_followers(self: &Arc<Self>, wf: WorkflowId, job: &Arc<dyn Job>, result: JobResult) {
        let mut targets: Vec<String> = self.workflows.ready_jobs(wf);
        match result {
            JobResult::Success => targets.extend(job.core().on_success.iter().cloned()),
            JobResult::Failure => targets.extend(job.core().on_failure.iter().cloned()),
            _ => {}
        }

        let mut seen = HashSet::new();
        for target in targets {
            if !seen.insert(target.clone()) {
                continue;
            }
            let Some(next_job) = self.tables.lock().find_active(&target) else {
                tracing::warn!(job = %target, "workflow trigger references unknown job");
                continue;
            };
            if !self.workflows.try_claim(wf, &target) {
                continue;
            }
            tracing::debug!(workflow = %wf, job = %target, "triggering workflow member");
            self.spawn_worker(next_job, Some(wf));
        }
    }
}

/// Run the job's own `run` on a separate task so a panic is contained and
/// surfaced as an error on this execution only.
async fn run_contained(ctx: Arc<Context>) -> Result<(), JobError> {
    let job = Arc::clone(&ctx.job);
    let handle = tokio::spawn(async move { job.run(ctx).await });
    match handle.await {
        Ok(result) => result,
        Err(join_error) if join_error.is_panic() => {
            let payload = join_error.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(panic = %message, "job panicked");
            Err(JobError::Unexpected(format!("panic: {message}")))
        }
        Err(_) => Err(JobError::Canceled),
    }
}

/// Transitive closure of `root` over dependency, on-success, and
/// on-failure edges, with each member's in-workflow dependencies.
pub(crate) fn workflow_closure(
    active: &[Arc<dyn Job>],
    root: &str,
) -> HashMap<String, Vec<String>> {
    let by_name: HashMap<&str, &Arc<dyn Job>> =
        active.iter().map(|j| (j.name(), j)).collect();

    let mut members: HashMap<String, Vec<String>> = HashMap::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(root.to_string());

    while let Some(current) = queue.pop_front() {
        if members.contains_key(&current) {
            continue;
        }
        let Some(job) = by_name.get(current.as_str()) else {
            continue;
        };
        members.insert(current.clone(), job.core().dependencies.clone());

        for follower in job
            .core()
            .on_success
            .iter()
            .chain(job.core().on_failure.iter())
        {
            queue.push_back(follower.clone());
        }
        for candidate in active {
            if candidate
                .core()
                .dependencies
                .iter()
                .any(|dep| dep == &current)
            {
                queue.push_back(candidate.name().to_string());
            }
        }
    }

    members
}
