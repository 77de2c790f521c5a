//! Injectable time source.
//!
//! Every component that reads the wall clock or sleeps does so through an
//! `Arc<dyn Clock>`, so schedule math, retry backoff, and retention cleanup
//! can be driven deterministically in tests via [`ManualClock`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Abstract time source.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for `duration`. The returned future completes when the clock
    /// has moved past `now() + duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Production clock backed by `Utc::now` and the tokio timer.
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

struct Sleeper {
    deadline: DateTime<Utc>,
    tx: oneshot::Sender<()>,
}

struct ManualState {
    now: DateTime<Utc>,
    sleepers: Vec<Sleeper>,
}

/// Virtual clock for tests. Time only moves when [`ManualClock::advance`]
/// is called; sleepers whose deadline has passed are woken in order.
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl std::fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualClock")
            .field("now", &self.state.lock().now)
            .finish()
    }
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now: start,
                sleepers: Vec::new(),
            })),
        }
    }

    /// A manual clock starting at an arbitrary fixed epoch.
    pub fn default_epoch() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    /// Move time forward and wake every sleeper whose deadline has passed.
    pub fn advance(&self, duration: Duration) {
        let due: Vec<oneshot::Sender<()>> = {
            let mut state = self.state.lock();
            state.now += chrono::Duration::from_std(duration).expect("advance out of range");
            let now = state.now;
            let mut keep = Vec::new();
            let mut due = Vec::new();
            for sleeper in state.sleepers.drain(..) {
                if sleeper.deadline <= now {
                    due.push(sleeper.tx);
                } else {
                    keep.push(sleeper);
                }
            }
            state.sleepers = keep;
            due
        };
        for tx in due {
            let _ = tx.send(());
        }
    }

    /// Number of tasks currently parked in `sleep`.
    pub fn sleeper_count(&self) -> usize {
        self.state.lock().sleepers.len()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().now
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if duration.is_zero() {
                return Box::pin(async {});
            }
            let deadline =
                state.now + chrono::Duration::from_std(duration).expect("sleep out of range");
            state.sleepers.push(Sleeper { deadline, tx });
        }
        Box::pin(async move {
            let _ = rx.await;
        })
    }
}
