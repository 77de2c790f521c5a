//! Abstract container-daemon surface consumed by container jobs.
//!
//! The concrete client (Docker, Swarm, anything speaking the same model)
//! lives outside this crate and implements [`ContainerProvider`]. Container
//! jobs only ever talk to this trait, which keeps the scheduler core free of
//! daemon plumbing and makes runs fully scriptable in tests.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::pool::SharedBuffer;
use crate::types::ProviderError;

#[cfg(test)]
pub mod mock;

/// Container creation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    pub image: String,
    pub cmd: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub working_dir: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub host: HostConfig,
}

/// Host-side container settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConfig {
    /// `host:container[:mode]` bind specs.
    pub binds: Vec<String>,
    pub volumes_from: Vec<String>,
    pub network_mode: Option<String>,
}

/// Exec creation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecConfig {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

/// Inspected container state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: Option<i64>,
    pub status: String,
}

/// Inspected exec state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
    pub pid: i64,
}

/// Swarm service creation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    /// Normalized image reference (tag always present).
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub networks: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Swarm task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Starting,
    Running,
    Complete,
    Failed,
    Rejected,
    Shutdown,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Complete | TaskState::Failed | TaskState::Rejected | TaskState::Shutdown
        )
    }
}

/// One swarm task observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub state: TaskState,
    pub exit_code: Option<i64>,
    pub message: String,
}

/// Log stream selector and window.
#[derive(Debug, Clone, Default)]
pub struct LogsOptions {
    pub since: Option<DateTime<Utc>>,
    pub stdout: bool,
    pub stderr: bool,
}

/// Which stream a log chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStreamKind {
    Stdout,
    Stderr,
}

/// A chunk of captured container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub kind: LogStreamKind,
    pub bytes: Vec<u8>,
}

/// Daemon event, as delivered by the event subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEvent {
    pub container_id: String,
    /// Daemon action name, e.g. `die`, `stop`, `start`.
    pub action: String,
    pub exit_code: Option<i64>,
}

/// Server-side event filter.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub container_id: Option<String>,
}

/// Known network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
}

/// Daemon identity and inventory summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemInfo {
    pub name: String,
    pub server_version: String,
    pub containers: u64,
}

/// Append `:latest` when a reference carries no tag or digest.
pub fn normalize_image_reference(reference: &str) -> String {
    let after_slash = reference.rsplit('/').next().unwrap_or(reference);
    if after_slash.contains(':') || reference.contains('@') {
        reference.to_string()
    } else {
        format!("{reference}:latest")
    }
}

/// Abstract surface over a container daemon.
///
/// Implementations wrap every daemon failure with the operation name and
/// the resource identifier involved (see [`ProviderError::operation`]).
/// Cancellation is structural: dropping a returned future aborts the
/// in-flight call.
#[async_trait]
pub trait ContainerProvider: Send + Sync {
    // ── Containers ──────────────────────────────────────────────────

    async fn create_container(
        &self,
        config: &ContainerConfig,
        name: Option<&str>,
    ) -> Result<String, ProviderError>;

    async fn start_container(&self, id: &str) -> Result<(), ProviderError>;

    async fn stop_container(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<(), ProviderError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), ProviderError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, ProviderError>;

    /// Block until the container exits and return its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, ProviderError>;

    async fn container_logs(
        &self,
        id: &str,
        options: LogsOptions,
    ) -> Result<BoxStream<'static, Result<LogChunk, ProviderError>>, ProviderError>;

    // ── Exec ────────────────────────────────────────────────────────

    async fn create_exec(
        &self,
        container: &str,
        config: &ExecConfig,
    ) -> Result<String, ProviderError>;

    /// Start a created exec and stream its attached output.
    async fn start_exec(
        &self,
        exec_id: &str,
    ) -> Result<BoxStream<'static, Result<LogChunk, ProviderError>>, ProviderError>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus, ProviderError>;

    /// Create, start, and drain an exec, piping output into the provided
    /// sinks. Returns the exec's exit code.
    async fn run_exec(
        &self,
        container: &str,
        config: &ExecConfig,
        stdout: SharedBuffer,
        stderr: SharedBuffer,
    ) -> Result<i64, ProviderError>;

    // ── Images ──────────────────────────────────────────────────────

    async fn pull_image(&self, reference: &str) -> Result<(), ProviderError>;

    async fn has_image_locally(&self, reference: &str) -> Result<bool, ProviderError>;

    /// Make `reference` available per the pull policy: with `force_pull`
    /// the registry wins; otherwise a local image is used when present and
    /// a pull is attempted only on a local miss.
    async fn ensure_image(&self, reference: &str, force_pull: bool) -> Result<(), ProviderError> {
        if force_pull {
            return self.pull_image(reference).await;
        }
        match self.has_image_locally(reference).await {
            Ok(true) => Ok(()),
            Ok(false) => self.pull_image(reference).await,
            Err(ProviderError::LocalImageNotFound { .. }) => self.pull_image(reference).await,
            Err(err) => Err(err),
        }
    }

    // ── Networks ────────────────────────────────────────────────────

    async fn connect_network(
        &self,
        network_id: &str,
        container_id: &str,
    ) -> Result<(), ProviderError>;

    async fn find_networks_by_name(&self, name: &str)
        -> Result<Vec<NetworkInfo>, ProviderError>;

    // ── Services ────────────────────────────────────────────────────

    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, ProviderError>;

    async fn list_service_tasks(
        &self,
        service_id: &str,
    ) -> Result<Vec<TaskStatus>, ProviderError>;

    async fn remove_service(&self, service_id: &str) -> Result<(), ProviderError>;

    // ── Events & system ─────────────────────────────────────────────

    async fn subscribe_events(
        &self,
        filter: EventFilter,
    ) -> Result<BoxStream<'static, Result<ProviderEvent, ProviderError>>, ProviderError>;

    async fn info(&self) -> Result<SystemInfo, ProviderError>;

    async fn ping(&self) -> Result<(), ProviderError>;
}
