//! Workflow orchestration: DAG-scoped state for one fire of a root job and
//! its transitively triggered dependents.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::clock::Clock;
use crate::metrics::MetricsRecorder;
use crate::types::{JobResult, WorkflowId, WorkflowStatus};

/// Cleanup/retention knobs, overridable from the environment.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorkflowConfig {
    #[serde(with = "humantime_serde", default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_retention")]
    pub retention: Duration,
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_retention() -> Duration {
    Duration::from_secs(24 * 3600)
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: default_cleanup_interval(),
            retention: default_retention(),
        }
    }
}

impl WorkflowConfig {
    /// Read `TIDECRON_WORKFLOW_CLEANUP_INTERVAL` and
    /// `TIDECRON_WORKFLOW_RETENTION` (humantime durations), keeping the
    /// defaults for missing or malformed values.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(interval) = duration_from_env("TIDECRON_WORKFLOW_CLEANUP_INTERVAL") {
            config.cleanup_interval = interval;
        }
        if let Some(retention) = duration_from_env("TIDECRON_WORKFLOW_RETENTION") {
            config.retention = retention;
        }
        config
    }
}

fn duration_from_env(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match humantime::parse_duration(raw.trim()) {
        Ok(duration) => Some(duration),
        Err(err) => {
            tracing::warn!(%key, value = %raw, error = %err, "ignoring invalid duration");
            None
        }
    }
}

/// State of one workflow execution.
#[derive(Debug, Clone)]
pub struct WorkflowExecution {
    pub id: WorkflowId,
    pub root: String,
    pub started_at: DateTime<Utc>,
    /// Job name → its dependencies within this workflow.
    members: HashMap<String, Vec<String>>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    skipped: HashSet<String>,
    running: HashSet<String>,
    done: bool,
}

impl WorkflowExecution {
    fn pending(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.members.iter().filter(|(name, _)| {
            !self.completed.contains(*name)
                && !self.failed.contains(*name)
                && !self.skipped.contains(*name)
                && !self.running.contains(*name)
        })
    }

    fn is_terminal(&self) -> bool {
        self.running.is_empty() && self.pending().next().is_none()
    }

    fn derive_status(&self) -> WorkflowStatus {
        if !self.failed.is_empty() {
            WorkflowStatus::Failure
        } else if self.completed.is_empty() && !self.skipped.is_empty() {
            WorkflowStatus::Skipped
        } else if self.skipped.is_empty() {
            WorkflowStatus::Success
        } else {
            WorkflowStatus::Mixed
        }
    }

    pub fn completed_jobs(&self) -> &HashSet<String> {
        &self.completed
    }

    pub fn failed_jobs(&self) -> &HashSet<String> {
        &self.failed
    }
}

/// Tracks live workflow executions and garbage-collects old ones.
pub struct WorkflowOrchestrator {
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsRecorder>,
    config: WorkflowConfig,
    executions: DashMap<WorkflowId, WorkflowExecution>,
    shutdown: Notify,
    cleanup_running: AtomicBool,
}

impl WorkflowOrchestrator {
    pub fn new(
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsRecorder>,
        config: WorkflowConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            metrics,
            config,
            executions: DashMap::new(),
            shutdown: Notify::new(),
            cleanup_running: AtomicBool::new(false),
        })
    }

    /// Open a new workflow execution rooted at `root`. `members` maps every
    /// participating job to its dependencies within the workflow.
    pub fn begin(&self, root: &str, members: HashMap<String, Vec<String>>) -> WorkflowId {
        let id = WorkflowId::new();
        let execution = WorkflowExecution {
            id,
            root: root.to_string(),
            started_at: self.clock.now(),
            members,
            completed: HashSet::new(),
            failed: HashSet::new(),
            skipped: HashSet::new(),
            running: HashSet::new(),
            done: false,
        };
        tracing::debug!(workflow = %id, root, "workflow execution started");
        self.executions.insert(id, execution);
        id
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    pub fn get(&self, id: WorkflowId) -> Option<WorkflowExecution> {
        self.executions.get(&id).map(|e| e.clone())
    }

    /// Dependency gate: a job with dependencies may only run inside a
    /// workflow where all of them have completed.
    pub fn can_execute(&self, workflow: Option<WorkflowId>, dependencies: &[String]) -> bool {
        if dependencies.is_empty() {
            return true;
        }
        let Some(id) = workflow else {
            return false;
        };
        let Some(execution) = self.executions.get(&id) else {
            return false;
        };
        dependencies
            .iter()
            .all(|dep| execution.completed.contains(dep))
    }

    pub fn mark_running(&self, workflow: WorkflowId, job: &str) {
        if let Some(mut execution) = self.executions.get_mut(&workflow) {
            execution.running.insert(job.to_string());
        }
    }

    /// Claim `job` for dispatch: moves it to running only if it is still a
    /// pending member. Returns false when the job already ran, is running,
    /// or was cascade-skipped.
    pub fn try_claim(&self, workflow: WorkflowId, job: &str) -> bool {
        let Some(mut execution) = self.executions.get_mut(&workflow) else {
            return false;
        };
        let pending = execution.members.contains_key(job)
            && !execution.completed.contains(job)
            && !execution.failed.contains(job)
            && !execution.skipped.contains(job)
            && !execution.running.contains(job);
        if pending {
            execution.running.insert(job.to_string());
        }
        pending
    }

    /// Record a terminal result for `job`, cascade skips to dependents of
    /// failed or skipped jobs, and emit the workflow-complete metric when
    /// every member has reached a terminal state.
    pub fn record_result(&self, workflow: WorkflowId, job: &str, result: JobResult) {
        let Some(mut execution) = self.executions.get_mut(&workflow) else {
            return;
        };

        execution.running.remove(job);
        match result {
            JobResult::Success => {
                execution.completed.insert(job.to_string());
            }
            JobResult::Failure => {
                execution.failed.insert(job.to_string());
            }
            JobResult::Skipped => {
                execution.skipped.insert(job.to_string());
            }
            JobResult::Pending => return,
        }
        self.metrics.workflow_job_result(job, result);

        // Dependents of a failed or skipped job can never run.
        loop {
            let dead: Vec<String> = execution
                .pending()
                .filter(|(_, deps)| {
                    deps.iter().any(|dep| {
                        execution.failed.contains(dep) || execution.skipped.contains(dep)
                    })
                })
                .map(|(name, _)| name.clone())
                .collect();
            if dead.is_empty() {
                break;
            }
            for name in dead {
                execution.skipped.insert(name.clone());
                self.metrics.workflow_job_result(&name, JobResult::Skipped);
            }
        }

        if execution.is_terminal() && !execution.done {
            execution.done = true;
            let status = execution.derive_status();
            tracing::info!(
                workflow = %workflow,
                root = %execution.root,
                status = %status,
                "workflow execution complete"
            );
            self.metrics.workflow_completed(&execution.root, status);
        }
    }

    /// Members whose dependencies are now satisfied and which have not yet
    /// started.
    pub fn ready_jobs(&self, workflow: WorkflowId) -> Vec<String> {
        let Some(execution) = self.executions.get(&workflow) else {
            return Vec::new();
        };
        execution
            .pending()
            .filter(|(_, deps)| {
                !deps.is_empty() && deps.iter().all(|dep| execution.completed.contains(dep))
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Remove executions older than the retention window.
    pub fn cleanup_pass(&self) -> usize {
        let cutoff = self.clock.now()
            - chrono::Duration::from_std(self.config.retention).unwrap_or_default();
        let stale: Vec<WorkflowId> = self
            .executions
            .iter()
            .filter(|entry| entry.started_at < cutoff)
            .map(|entry| entry.id)
            .collect();
        for id in &stale {
            self.executions.remove(id);
        }
        if !stale.is_empty() {
            tracing::debug!(removed = stale.len(), "workflow cleanup pass");
        }
        stale.len()
    }

    /// Start the periodic cleanup ticker. Idempotent.
    pub fn start_cleanup(self: &Arc<Self>) {
        if self.cleanup_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = orchestrator.clock.sleep(orchestrator.config.cleanup_interval) => {
                        if !orchestrator.cleanup_running.load(Ordering::SeqCst) {
                            break;
                        }
                        orchestrator.cleanup_pass();
                    }
                    _ = orchestrator.shutdown.notified() => break,
                }
            }
        });
    }

    pub fn stop_cleanup(&self) {
        self.shutdown.notify_waiters();
        self.cleanup_running.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn set_started_at(&self, workflow: WorkflowId, at: DateTime<Utc>) {
        if let Some(mut execution) = self.executions.get_mut(&workflow) {
            execution.started_at = at;
        }
    }
}
