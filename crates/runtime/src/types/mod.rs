//! Core types and identifiers for the scheduler runtime.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

pub mod error;

pub use error::*;

/// Unique identifier for one fire of a workflow DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a registered cron-engine entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduler lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Why a fire was skipped instead of dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    Overlap,
    Capacity,
    Dependency,
    Shutdown,
    Disabled,
}

impl SkipReason {
    /// Stable lower-case label used for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Overlap => "overlap",
            SkipReason::Capacity => "capacity",
            SkipReason::Dependency => "dependency",
            SkipReason::Shutdown => "shutdown",
            SkipReason::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a whole workflow execution. Failure dominates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Success,
    Failure,
    Skipped,
    Mixed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Success => "success",
            WorkflowStatus::Failure => "failure",
            WorkflowStatus::Skipped => "skipped",
            WorkflowStatus::Mixed => "mixed",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job result within a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobResult {
    Success,
    Failure,
    Skipped,
    Pending,
}

impl std::fmt::Display for JobResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobResult::Success => "Success",
            JobResult::Failure => "Failure",
            JobResult::Skipped => "Skipped",
            JobResult::Pending => "Pending",
        };
        f.write_str(s)
    }
}

/// Outcome of one dispatch attempt, as seen by the scheduler wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    RanSuccess,
    RanFailure,
    Skipped(SkipReason),
}

/// Lightweight cancellation handle derived from the scheduler's root.
///
/// Workers observe cancellation at their next suspension point; a cancelled
/// run surfaces [`error::JobError::Canceled`].
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_reason_labels_are_stable() {
        assert_eq!(SkipReason::Overlap.as_str(), "overlap");
        assert_eq!(SkipReason::Capacity.as_str(), "capacity");
        assert_eq!(SkipReason::Dependency.as_str(), "dependency");
        assert_eq!(SkipReason::Shutdown.as_str(), "shutdown");
        assert_eq!(SkipReason::Disabled.as_str(), "disabled");
    }

    #[test]
    fn workflow_ids_are_unique() {
        assert_ne!(WorkflowId::new(), WorkflowId::new());
    }

    #[tokio::test]
    async fn cancel_token_observed_by_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let observer = token.clone();
        let handle = tokio::spawn(async move {
            observer.cancelled().await;
        });

        token.cancel();
        assert!(token.is_cancelled());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }
}
