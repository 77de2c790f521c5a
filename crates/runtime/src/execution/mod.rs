//! One concrete run of a job.
//!
//! An execution is created at dispatch, carries the captured output streams,
//! and is sealed exactly once when the run finishes. Sealed executions are
//! retained in the owning job's history ring.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::pool::{RingBuffer, SharedBuffer};
use crate::types::JobError;

pub mod context;
pub mod middleware;

pub use context::Context;
pub use middleware::{Middleware, MiddlewareSet, SaveMiddleware};

/// Generate the 12-hex-char execution identifier.
fn new_execution_id() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// State of one run instance.
#[derive(Debug)]
pub struct Execution {
    pub id: String,
    pub output: SharedBuffer,
    pub error_output: SharedBuffer,
    pub started_at: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub is_running: bool,
    pub failed: bool,
    pub skipped: bool,
    pub error: Option<JobError>,
}

impl Execution {
    pub fn new(output: RingBuffer, error_output: RingBuffer) -> Self {
        Self {
            id: new_execution_id(),
            output: SharedBuffer::new(output),
            error_output: SharedBuffer::new(error_output),
            started_at: None,
            duration: Duration::ZERO,
            is_running: false,
            failed: false,
            skipped: false,
            error: None,
        }
    }

    /// Mark the run as started.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.is_running = true;
        self.started_at = Some(now);
    }

    /// Seal the run: `Ok` is success, the skip sentinel is a skip (not a
    /// failure, no error retained), anything else is a failure with the
    /// error preserved.
    pub fn stop(&mut self, now: DateTime<Utc>, result: Result<(), JobError>) {
        self.is_running = false;
        if let Some(started) = self.started_at {
            self.duration = (now - started).to_std().unwrap_or_default();
        }
        match result {
            Ok(()) => {
                self.failed = false;
                self.skipped = false;
            }
            Err(JobError::Skipped) => {
                self.failed = false;
                self.skipped = true;
                self.error = None;
            }
            Err(err) => {
                self.failed = true;
                self.skipped = false;
                self.error = Some(err);
            }
        }
    }
}

/// Shared handle to an execution, cloned into the context, the worker task,
/// and the job history.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    inner: Arc<Mutex<Execution>>,
}

impl ExecutionHandle {
    pub fn new(execution: Execution) -> Self {
        Self {
            inner: Arc::new(Mutex::new(execution)),
        }
    }

    pub fn id(&self) -> String {
        self.inner.lock().id.clone()
    }

    pub fn output(&self) -> SharedBuffer {
        self.inner.lock().output.clone()
    }

    pub fn error_output(&self) -> SharedBuffer {
        self.inner.lock().error_output.clone()
    }

    pub fn start(&self, now: DateTime<Utc>) {
        self.inner.lock().start(now);
    }

    pub fn stop(&self, now: DateTime<Utc>, result: Result<(), JobError>) {
        self.inner.lock().stop(now, result);
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().is_running
    }

    pub fn failed(&self) -> bool {
        self.inner.lock().failed
    }

    pub fn skipped(&self) -> bool {
        self.inner.lock().skipped
    }

    pub fn duration(&self) -> Duration {
        self.inner.lock().duration
    }

    pub fn error_string(&self) -> Option<String> {
        self.inner.lock().error.as_ref().map(|e| e.to_string())
    }

    /// Serializable snapshot for reports and history queries.
    pub fn report(&self, job_name: &str) -> ExecutionReport {
        let exec = self.inner.lock();
        ExecutionReport {
            execution_id: exec.id.clone(),
            job_name: job_name.to_string(),
            started_at: exec.started_at,
            duration_ms: exec.duration.as_millis() as u64,
            failed: exec.failed,
            skipped: exec.skipped,
            error: exec.error.as_ref().map(|e| e.to_string()),
            stdout: exec.output.to_string_lossy(),
            stderr: exec.error_output.to_string_lossy(),
        }
    }

    /// Swap the capture buffers out for return to the pool, leaving the
    /// execution holding exact-size detached copies so history queries and
    /// reports still see the output. Only meaningful once the run is sealed
    /// and stream writers are gone.
    pub fn reclaim_buffers(&self) -> (Option<RingBuffer>, Option<RingBuffer>) {
        let detach = |buffer: &SharedBuffer| {
            let contents = buffer.contents();
            let mut copy = RingBuffer::with_capacity(contents.len().max(1));
            copy.push(&contents);
            SharedBuffer::new(copy)
        };

        let (out, err) = {
            let mut exec = self.inner.lock();
            let out_copy = detach(&exec.output);
            let err_copy = detach(&exec.error_output);
            let out = std::mem::replace(&mut exec.output, out_copy);
            let err = std::mem::replace(&mut exec.error_output, err_copy);
            (out, err)
        };
        (out.try_take(), err.try_take())
    }
}

/// Flat, serializable view of a sealed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub job_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub failed: bool,
    pub skipped: bool,
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
}
