//! Pluggable performance-metrics surface.
//!
//! The runtime emits every observation through a [`MetricsRecorder`].
//! Exporter backends live outside this crate; bundled here are the no-op
//! recorder, a tracing-backed recorder, and an in-memory recorder used by
//! dashboards and tests.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::pool::PoolStats;
use crate::types::{JobResult, SkipReason, WorkflowStatus};

/// Recorder for everything the scheduler core observes. All methods default
/// to no-ops so implementations only pick up what they care about.
pub trait MetricsRecorder: Send + Sync {
    fn job_started(&self, _name: &str) {}
    fn job_completed(&self, _name: &str, _duration: Duration, _success: bool) {}
    fn job_scheduled(&self, _name: &str) {}
    fn job_skipped(&self, _name: &str, _reason: SkipReason) {}
    fn job_retry(&self, _name: &str, _attempt: u32, _success: bool) {}
    fn workflow_completed(&self, _root: &str, _status: WorkflowStatus) {}
    fn workflow_job_result(&self, _name: &str, _result: JobResult) {}
    fn container_wait_duration(&self, _duration: Duration) {}
    fn container_monitor_method(&self, _using_events: bool) {}
    fn container_monitor_fallback(&self) {}
    fn container_event(&self) {}
    fn provider_operation(&self, _op: &str) {}
    fn provider_error(&self, _op: &str) {}
    fn provider_latency(&self, _op: &str, _duration: Duration) {}
    fn pool_stats(&self, _stats: &PoolStats) {}
    fn concurrent_jobs(&self, _count: usize) {}
    fn memory_usage(&self, _bytes: u64) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone)]
pub struct NullRecorder;

impl MetricsRecorder for NullRecorder {}

/// Forwards observations to `tracing` at debug level.
#[derive(Debug, Default, Clone)]
pub struct LogRecorder;

impl MetricsRecorder for LogRecorder {
    fn job_started(&self, name: &str) {
        tracing::debug!(job = name, "metric: job.start");
    }

    fn job_completed(&self, name: &str, duration: Duration, success: bool) {
        tracing::debug!(job = name, ?duration, success, "metric: job.complete");
    }

    fn job_scheduled(&self, name: &str) {
        tracing::debug!(job = name, "metric: job.scheduled");
    }

    fn job_skipped(&self, name: &str, reason: SkipReason) {
        tracing::debug!(job = name, reason = %reason, "metric: job.skipped");
    }

    fn job_retry(&self, name: &str, attempt: u32, success: bool) {
        tracing::debug!(job = name, attempt, success, "metric: job.retry");
    }

    fn workflow_completed(&self, root: &str, status: WorkflowStatus) {
        tracing::debug!(root, status = %status, "metric: workflow.complete");
    }

    fn workflow_job_result(&self, name: &str, result: JobResult) {
        tracing::debug!(job = name, result = %result, "metric: workflow.job_result");
    }

    fn container_wait_duration(&self, duration: Duration) {
        tracing::debug!(?duration, "metric: container.wait_duration");
    }

    fn container_monitor_method(&self, using_events: bool) {
        tracing::debug!(using_events, "metric: container.monitor_method");
    }

    fn container_monitor_fallback(&self) {
        tracing::debug!("metric: container.monitor_fallback");
    }

    fn container_event(&self) {
        tracing::debug!("metric: container.event");
    }

    fn provider_operation(&self, op: &str) {
        tracing::debug!(op, "metric: docker.operation");
    }

    fn provider_error(&self, op: &str) {
        tracing::debug!(op, "metric: docker.error");
    }

    fn provider_latency(&self, op: &str, duration: Duration) {
        tracing::debug!(op, ?duration, "metric: docker.latency");
    }

    fn pool_stats(&self, stats: &PoolStats) {
        tracing::debug!(gets = stats.gets, hit_rate = stats.hit_rate, "metric: pool.stats");
    }

    fn concurrent_jobs(&self, count: usize) {
        tracing::debug!(count, "metric: concurrent_jobs");
    }

    fn memory_usage(&self, bytes: u64) {
        tracing::debug!(bytes, "metric: memory_usage");
    }
}

#[derive(Default)]
struct MemoryState {
    counters: HashMap<String, u64>,
    completions: Vec<(String, Duration, bool)>,
    retries: Vec<(String, u32, bool)>,
    skips: Vec<(String, SkipReason)>,
    workflow_completions: Vec<(String, WorkflowStatus)>,
    workflow_results: Vec<(String, JobResult)>,
    last_pool_stats: Option<PoolStats>,
    max_concurrent_seen: usize,
}

/// Retains observations in memory behind a lock.
#[derive(Default)]
pub struct MemoryRecorder {
    state: Mutex<MemoryState>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, key: String) {
        *self.state.lock().counters.entry(key).or_insert(0) += 1;
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.state.lock().counters.get(key).copied().unwrap_or(0)
    }

    pub fn completions(&self, name: &str) -> Vec<(Duration, bool)> {
        self.state
            .lock()
            .completions
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, d, s)| (*d, *s))
            .collect()
    }

    pub fn retries(&self, name: &str) -> Vec<(u32, bool)> {
        self.state
            .lock()
            .retries
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, a, s)| (*a, *s))
            .collect()
    }

    pub fn skips(&self, name: &str, reason: SkipReason) -> usize {
        self.state
            .lock()
            .skips
            .iter()
            .filter(|(n, r)| n == name && *r == reason)
            .count()
    }

    pub fn workflow_completions(&self) -> Vec<(String, WorkflowStatus)> {
        self.state.lock().workflow_completions.clone()
    }

    pub fn workflow_results(&self) -> Vec<(String, JobResult)> {
        self.state.lock().workflow_results.clone()
    }

    pub fn last_pool_stats(&self) -> Option<PoolStats> {
        self.state.lock().last_pool_stats.clone()
    }

    pub fn max_concurrent_seen(&self) -> usize {
        self.state.lock().max_concurrent_seen
    }
}

impl MetricsRecorder for MemoryRecorder {
    fn job_started(&self, name: &str) {
        self.bump(format!("job.start.{name}"));
    }

    fn job_completed(&self, name: &str, duration: Duration, success: bool) {
        self.bump(format!("job.complete.{name}"));
        self.state
            .lock()
            .completions
            .push((name.to_string(), duration, success));
    }

    fn job_scheduled(&self, name: &str) {
        self.bump(format!("job.scheduled.{name}"));
    }

    fn job_skipped(&self, name: &str, reason: SkipReason) {
        self.bump(format!("job.skipped.{name}.{reason}"));
        self.state.lock().skips.push((name.to_string(), reason));
    }

    fn job_retry(&self, name: &str, attempt: u32, success: bool) {
        self.state
            .lock()
            .retries
            .push((name.to_string(), attempt, success));
    }

    fn workflow_completed(&self, root: &str, status: WorkflowStatus) {
        self.state
            .lock()
            .workflow_completions
            .push((root.to_string(), status));
    }

    fn workflow_job_result(&self, name: &str, result: JobResult) {
        self.state
            .lock()
            .workflow_results
            .push((name.to_string(), result));
    }

    fn container_wait_duration(&self, _duration: Duration) {
        self.bump("container.wait_duration".to_string());
    }

    fn container_monitor_method(&self, using_events: bool) {
        self.bump(format!("container.monitor_method.{using_events}"));
    }

    fn container_monitor_fallback(&self) {
        self.bump("container.monitor_fallback".to_string());
    }

    fn container_event(&self) {
        self.bump("container.event".to_string());
    }

    fn provider_operation(&self, op: &str) {
        self.bump(format!("docker.operation.{op}"));
    }

    fn provider_error(&self, op: &str) {
        self.bump(format!("docker.error.{op}"));
    }

    fn provider_latency(&self, _op: &str, _duration: Duration) {}

    fn pool_stats(&self, stats: &PoolStats) {
        self.state.lock().last_pool_stats = Some(stats.clone());
    }

    fn concurrent_jobs(&self, count: usize) {
        let mut state = self.state.lock();
        if count > state.max_concurrent_seen {
            state.max_concurrent_seen = count;
        }
    }

    fn memory_usage(&self, _bytes: u64) {}
}
