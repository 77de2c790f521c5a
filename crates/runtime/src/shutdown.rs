//! Graceful-shutdown manager.
//!
//! Hooks are registered with a name and a priority (lower runs earlier).
//! `shutdown` broadcasts the stop signal, then runs the hooks priority
//! group by priority group, with hooks inside one group running
//! concurrently, all under a single timeout. A second `shutdown` call
//! reports shutdown-in-progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::types::{CancelToken, ShutdownError};

type HookFn = Box<dyn Fn() -> BoxFuture<'static, Result<(), anyhow::Error>> + Send + Sync>;

struct Hook {
    name: String,
    priority: i32,
    action: HookFn,
}

pub struct ShutdownManager {
    clock: Arc<dyn Clock>,
    timeout: Duration,
    hooks: Mutex<Vec<Hook>>,
    begun: AtomicBool,
    signal: CancelToken,
    signal_handler_installed: AtomicBool,
}

impl ShutdownManager {
    pub fn new(clock: Arc<dyn Clock>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            clock,
            timeout,
            hooks: Mutex::new(Vec::new()),
            begun: AtomicBool::new(false),
            signal: CancelToken::new(),
            signal_handler_installed: AtomicBool::new(false),
        })
    }

    /// Register a hook. Lower priorities run earlier; equal priorities run
    /// concurrently.
    pub fn register<F, Fut>(&self, name: impl Into<String>, priority: i32, action: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        self.hooks.lock().push(Hook {
            name: name.into(),
            priority,
            action: Box::new(move || Box::pin(action())),
        });
    }

    /// Broadcast handle for in-flight work; cancelled when shutdown begins.
    pub fn subscribe(&self) -> CancelToken {
        self.signal.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.begun.load(Ordering::SeqCst)
    }

    /// Run the shutdown sequence once. Subsequent calls fail with
    /// shutdown-in-progress.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        if self.begun.swap(true, Ordering::SeqCst) {
            return Err(ShutdownError::InProgress);
        }

        tracing::info!("shutdown started");
        self.signal.cancel();

        let mut hooks = std::mem::take(&mut *self.hooks.lock());
        hooks.sort_by_key(|h| h.priority);

        let run_all = async {
            let mut failures: Vec<(String, String)> = Vec::new();
            let mut index = 0;
            while index < hooks.len() {
                let priority = hooks[index].priority;
                let group_end = hooks[index..]
                    .iter()
                    .position(|h| h.priority != priority)
                    .map(|offset| index + offset)
                    .unwrap_or(hooks.len());

                let group = &hooks[index..group_end];
                let results =
                    futures::future::join_all(group.iter().map(|hook| (hook.action)())).await;
                for (hook, result) in group.iter().zip(results) {
                    if let Err(err) = result {
                        tracing::error!(hook = %hook.name, error = %err, "shutdown hook failed");
                        failures.push((hook.name.clone(), err.to_string()));
                    } else {
                        tracing::debug!(hook = %hook.name, "shutdown hook finished");
                    }
                }
                index = group_end;
            }
            failures
        };

        let failures = tokio::select! {
            failures = run_all => failures,
            _ = self.clock.sleep(self.timeout) => {
                tracing::error!(timeout = ?self.timeout, "shutdown timed out");
                return Err(ShutdownError::Timeout {
                    timeout: self.timeout,
                });
            }
        };

        if failures.is_empty() {
            tracing::info!("shutdown complete");
            Ok(())
        } else {
            let details = failures
                .iter()
                .map(|(name, err)| format!("{name}: {err}"))
                .collect::<Vec<_>>()
                .join("; ");
            Err(ShutdownError::HookFailures {
                failed: failures.len(),
                details,
            })
        }
    }

    /// Install a task that runs `shutdown` on SIGINT/SIGTERM. Idempotent.
    pub fn install_signal_handler(self: &Arc<Self>) {
        if self.signal_handler_installed.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            wait_for_termination_signal().await;
            tracing::info!("termination signal received");
            if let Err(err) = manager.shutdown().await {
                tracing::error!(error = %err, "signal-driven shutdown failed");
            }
        });
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            tracing::error!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
