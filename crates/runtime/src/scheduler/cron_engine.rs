//! Schedule expressions and the cron engine.
//!
//! The engine owns the registered entries and produces `(entry, fire time)`
//! pairs on a channel; the scheduler's dispatcher consumes them and spawns
//! workers. Catch-up is burst-style: if several periods elapsed since the
//! last wake, one fire is emitted per missed period (bounded).

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::clock::Clock;
use crate::types::{EntryId, ScheduleError};

/// Cap on catch-up fires emitted per entry per wake.
const MAX_CATCHUP_FIRES: usize = 100;

/// Idle sleep when no entry has a next fire time.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// Parsed schedule expression.
#[derive(Debug, Clone)]
pub enum ScheduleKind {
    /// Cron expression with seconds resolution.
    Cron(Box<cron::Schedule>),
    /// Fixed interval, first fire one period after registration.
    Every(Duration),
    /// Registered but never time-fired; runs via triggers only.
    Triggered,
    /// Fired once when the scheduler starts, never by time.
    Startup,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    raw: String,
    kind: ScheduleKind,
}

impl Schedule {
    /// Parse a schedule expression: 5/6/7-field cron (5-field gets a `0`
    /// seconds prefix), `@every <duration>`, the `@hourly`-style macros,
    /// `@reboot`/`@startup`, and the `@triggered` sentinel.
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(ScheduleError::Empty);
        }

        let parse_err = |reason: String| ScheduleError::Parse {
            expr: trimmed.to_string(),
            reason,
        };

        let kind = match trimmed {
            "@triggered" => ScheduleKind::Triggered,
            "@reboot" | "@startup" => ScheduleKind::Startup,
            "@hourly" => cron_kind("0 0 * * * *", &parse_err)?,
            "@daily" | "@midnight" => cron_kind("0 0 0 * * *", &parse_err)?,
            "@weekly" => cron_kind("0 0 0 * * Sun", &parse_err)?,
            "@monthly" => cron_kind("0 0 0 1 * *", &parse_err)?,
            "@yearly" | "@annually" => cron_kind("0 0 0 1 1 *", &parse_err)?,
            other => {
                if let Some(rest) = other.strip_prefix("@every ") {
                    let duration = humantime::parse_duration(rest.trim())
                        .map_err(|e| parse_err(e.to_string()))?;
                    if duration.is_zero() {
                        return Err(parse_err("@every interval must be non-zero".to_string()));
                    }
                    ScheduleKind::Every(duration)
                } else if other.starts_with('@') {
                    return Err(parse_err("unknown schedule extension".to_string()));
                } else {
                    let fields = other.split_whitespace().count();
                    let normalized = match fields {
                        5 => format!("0 {other}"),
                        6 | 7 => other.to_string(),
                        n => {
                            return Err(parse_err(format!(
                                "expected 5, 6, or 7 cron fields, found {n}"
                            )))
                        }
                    };
                    cron_kind(&normalized, &parse_err)?
                }
            }
        };

        Ok(Self {
            raw: trimmed.to_string(),
            kind,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> &ScheduleKind {
        &self.kind
    }

    /// Whether this schedule ever fires by time.
    pub fn fires(&self) -> bool {
        matches!(self.kind, ScheduleKind::Cron(_) | ScheduleKind::Every(_))
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self.kind, ScheduleKind::Triggered)
    }

    pub fn runs_on_startup(&self) -> bool {
        matches!(self.kind, ScheduleKind::Startup)
    }

    /// Next fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            ScheduleKind::Cron(schedule) => schedule.after(&after).next(),
            ScheduleKind::Every(interval) => {
                Some(after + chrono::Duration::from_std(*interval).ok()?)
            }
            ScheduleKind::Triggered | ScheduleKind::Startup => None,
        }
    }
}

fn cron_kind(
    expr: &str,
    parse_err: &impl Fn(String) -> ScheduleError,
) -> Result<ScheduleKind, ScheduleError> {
    cron::Schedule::from_str(expr)
        .map(|s| ScheduleKind::Cron(Box::new(s)))
        .map_err(|e| parse_err(e.to_string()))
}

/// One timed fire produced by the engine.
#[derive(Debug, Clone)]
pub struct Fire {
    pub entry: EntryId,
    pub job: String,
    pub at: DateTime<Utc>,
}

struct Entry {
    id: EntryId,
    job: String,
    schedule: Schedule,
    next_fire: Option<DateTime<Utc>>,
}

/// Produces fires for registered entries on its own task.
pub struct CronEngine {
    clock: Arc<dyn Clock>,
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    changed: Notify,
    shutdown: Notify,
    running: AtomicBool,
    fires_tx: mpsc::UnboundedSender<Fire>,
    fires_rx: Mutex<Option<mpsc::UnboundedReceiver<Fire>>>,
}

impl CronEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        let (fires_tx, fires_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            clock,
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            changed: Notify::new(),
            shutdown: Notify::new(),
            running: AtomicBool::new(false),
            fires_tx,
            fires_rx: Mutex::new(Some(fires_rx)),
        })
    }

    /// The fire channel; consumable exactly once.
    pub fn take_fires(&self) -> Option<mpsc::UnboundedReceiver<Fire>> {
        self.fires_rx.lock().take()
    }

    /// Register an entry. Triggered/startup schedules get an entry but no
    /// fire time.
    pub fn add(&self, job: &str, schedule: Schedule) -> EntryId {
        let id = EntryId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let next_fire = schedule.next_after(self.clock.now());
        self.entries.lock().push(Entry {
            id,
            job: job.to_string(),
            schedule,
            next_fire,
        });
        // notify_one stores a permit, so a registration landing while the
        // loop is mid-pass is not lost.
        self.changed.notify_one();
        id
    }

    pub fn remove(&self, id: EntryId) {
        self.entries.lock().retain(|e| e.id != id);
        self.changed.notify_one();
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Start the tick loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if !engine.running.load(Ordering::SeqCst) {
                    break;
                }

                let sleep_for = engine.fire_due_and_next_deadline();
                tokio::select! {
                    _ = engine.clock.sleep(sleep_for) => {}
                    _ = engine.changed.notified() => {}
                    _ = engine.shutdown.notified() => break,
                }
            }
            tracing::debug!("cron engine loop exited");
        });
    }

    /// Stop producing fires. Entries stay registered for a later restart.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Emit fires for every due entry (with burst catch-up) and return the
    /// time until the earliest upcoming fire.
    fn fire_due_and_next_deadline(&self) -> Duration {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let mut next_deadline: Option<DateTime<Utc>> = None;

        for entry in entries.iter_mut() {
            let mut fired = 0usize;
            while let Some(due) = entry.next_fire {
                if due > now || fired >= MAX_CATCHUP_FIRES {
                    break;
                }
                let _ = self.fires_tx.send(Fire {
                    entry: entry.id,
                    job: entry.job.clone(),
                    at: due,
                });
                fired += 1;
                entry.next_fire = entry.schedule.next_after(due);
            }

            if let Some(next) = entry.next_fire {
                next_deadline = Some(match next_deadline {
                    Some(current) if current <= next => current,
                    _ => next,
                });
            }
        }

        match next_deadline {
            Some(deadline) => (deadline - now).to_std().unwrap_or(Duration::from_millis(1)),
            None => IDLE_SLEEP,
        }
    }
}
