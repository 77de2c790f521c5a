//! Configurable job doubles used across the crate's tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Job, JobCore};
use crate::execution::Context;
use crate::hash::FieldHasher;
use crate::types::JobError;

/// Build a context around `job` with system clock, null metrics, and a
/// fresh cancel token.
pub fn test_context(job: Arc<dyn Job>) -> Arc<Context> {
    use crate::clock::SystemClock;
    use crate::execution::{Execution, ExecutionHandle};
    use crate::metrics::NullRecorder;
    use crate::pool::RingBuffer;
    use crate::types::CancelToken;

    let execution = ExecutionHandle::new(Execution::new(
        RingBuffer::with_capacity(64 * 1024),
        RingBuffer::with_capacity(64 * 1024),
    ));
    Context::new(
        job,
        execution,
        Arc::new(SystemClock),
        Arc::new(NullRecorder),
        CancelToken::new(),
        Vec::new(),
        None,
        None,
    )
}

/// Scriptable job: optional per-run delay (driven by the context clock),
/// a queue of outcomes (empty queue = success), and a run counter.
pub struct TestJob {
    core: JobCore,
    delay: Option<Duration>,
    outcomes: Mutex<VecDeque<Result<(), JobError>>>,
    runs: Arc<AtomicU32>,
}

impl TestJob {
    pub fn new(name: &str, schedule: &str) -> Self {
        Self {
            core: JobCore::new(name, schedule, "true"),
            delay: None,
            outcomes: Mutex::new(VecDeque::new()),
            runs: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_outcomes(self, outcomes: Vec<Result<(), JobError>>) -> Self {
        *self.outcomes.lock() = outcomes.into();
        self
    }

    pub fn core_mut(&mut self) -> &mut JobCore {
        &mut self.core
    }

    pub fn run_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.runs)
    }
}

#[async_trait]
impl Job for TestJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    async fn run(&self, ctx: Arc<Context>) -> Result<(), JobError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = ctx.clock.sleep(delay) => {}
                _ = ctx.cancel.cancelled() => return Err(JobError::Canceled),
            }
        }
        self.outcomes.lock().pop_front().unwrap_or(Ok(()))
    }

    fn hash(&self) -> Result<String, JobError> {
        let mut hasher = FieldHasher::new();
        self.core.hash_into(&mut hasher);
        Ok(hasher.finish())
    }

    fn validate(&self) -> Result<(), JobError> {
        Ok(())
    }
}

/// Job that always returns a fixed outcome immediately.
pub struct StubJob {
    core: JobCore,
    error: Option<JobError>,
}

impl StubJob {
    pub fn succeeding(name: &str) -> Self {
        Self {
            core: JobCore::new(name, "@triggered", "true"),
            error: None,
        }
    }

    pub fn failing(name: &str, error: JobError) -> Self {
        Self {
            core: JobCore::new(name, "@triggered", "false"),
            error: Some(error),
        }
    }
}

#[async_trait]
impl Job for StubJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    async fn run(&self, _ctx: Arc<Context>) -> Result<(), JobError> {
        match &self.error {
            None => Ok(()),
            Some(err) => Err(err.clone()),
        }
    }

    fn hash(&self) -> Result<String, JobError> {
        let mut hasher = FieldHasher::new();
        self.core.hash_into(&mut hasher);
        Ok(hasher.finish())
    }

    fn validate(&self) -> Result<(), JobError> {
        Ok(())
    }
}

/// Job that bumps a shared counter on every run.
pub struct CountingJob {
    core: JobCore,
    runs: Arc<AtomicU32>,
}

impl CountingJob {
    pub fn new(name: &str, runs: Arc<AtomicU32>) -> Self {
        Self {
            core: JobCore::new(name, "@triggered", "true"),
            runs,
        }
    }
}

#[async_trait]
impl Job for CountingJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    async fn run(&self, _ctx: Arc<Context>) -> Result<(), JobError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn hash(&self) -> Result<String, JobError> {
        let mut hasher = FieldHasher::new();
        self.core.hash_into(&mut hasher);
        Ok(hasher.finish())
    }

    fn validate(&self) -> Result<(), JobError> {
        Ok(())
    }
}
