//! In-memory provider double for tests.
//!
//! Scriptable per-area behavior: seed local images, fail pulls, enqueue
//! exec results and service-task observations, and finish containers by
//! hand. Every call is recorded so tests can assert on operation order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use super::*;
use crate::pool::SharedBuffer;
use crate::types::ProviderError;

#[derive(Debug, Clone)]
pub struct MockExecResult {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

struct MockContainer {
    name: Option<String>,
    config: ContainerConfig,
    running: bool,
    exit_code: Option<i64>,
    logs: Vec<LogChunk>,
    done_tx: watch::Sender<Option<i64>>,
}

#[derive(Default)]
struct MockState {
    local_images: HashSet<String>,
    pull_failure: Option<String>,
    pulled: Vec<String>,
    containers: HashMap<String, MockContainer>,
    created_order: Vec<String>,
    removed: Vec<(String, bool)>,
    networks: Vec<NetworkInfo>,
    connected: Vec<(String, String)>,
    exec_results: VecDeque<MockExecResult>,
    execs: Vec<(String, ExecConfig)>,
    services: HashMap<String, ServiceSpec>,
    service_tasks: VecDeque<Vec<TaskStatus>>,
    removed_services: Vec<String>,
    ops: Vec<String>,
    default_logs: Vec<LogChunk>,
}

pub struct MockProvider {
    state: Mutex<MockState>,
    counter: AtomicU64,
    events_supported: AtomicBool,
    /// Finish a container immediately on start with this exit code.
    auto_finish: Mutex<Option<i64>>,
    events_tx: broadcast::Sender<ProviderEvent>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(MockState::default()),
            counter: AtomicU64::new(0),
            events_supported: AtomicBool::new(true),
            auto_finish: Mutex::new(None),
            events_tx,
        }
    }

    fn record(&self, op: &str) {
        self.state.lock().ops.push(op.to_string());
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().ops.clone()
    }

    pub fn add_local_image(&self, reference: &str) {
        self.state.lock().local_images.insert(reference.to_string());
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.state.lock().pulled.clone()
    }

    pub fn set_pull_failure(&self, reason: &str) {
        self.state.lock().pull_failure = Some(reason.to_string());
    }

    pub fn set_events_supported(&self, supported: bool) {
        self.events_supported.store(supported, Ordering::SeqCst);
    }

    /// Containers finish with this exit code as soon as they are started.
    pub fn set_auto_finish(&self, exit_code: i64) {
        *self.auto_finish.lock() = Some(exit_code);
    }

    pub fn push_exec_result(&self, result: MockExecResult) {
        self.state.lock().exec_results.push_back(result);
    }

    pub fn execs(&self) -> Vec<(String, ExecConfig)> {
        self.state.lock().execs.clone()
    }

    pub fn add_network(&self, id: &str, name: &str) {
        self.state.lock().networks.push(NetworkInfo {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    pub fn connections(&self) -> Vec<(String, String)> {
        self.state.lock().connected.clone()
    }

    pub fn created_containers(&self) -> Vec<String> {
        self.state.lock().created_order.clone()
    }

    pub fn container_name(&self, id: &str) -> Option<String> {
        self.state
            .lock()
            .containers
            .get(id)
            .and_then(|c| c.name.clone())
    }

    pub fn container_config(&self, id: &str) -> Option<ContainerConfig> {
        self.state.lock().containers.get(id).map(|c| c.config.clone())
    }

    pub fn removed_containers(&self) -> Vec<(String, bool)> {
        self.state.lock().removed.clone()
    }

    pub fn set_container_logs(&self, id: &str, logs: Vec<LogChunk>) {
        if let Some(container) = self.state.lock().containers.get_mut(id) {
            container.logs = logs;
        }
    }

    /// Logs attached to every container created after this call.
    pub fn set_default_logs(&self, logs: Vec<LogChunk>) {
        self.state.lock().default_logs = logs;
    }

    pub fn push_service_tasks(&self, tasks: Vec<TaskStatus>) {
        self.state.lock().service_tasks.push_back(tasks);
    }

    pub fn services(&self) -> Vec<ServiceSpec> {
        self.state.lock().services.values().cloned().collect()
    }

    pub fn removed_services(&self) -> Vec<String> {
        self.state.lock().removed_services.clone()
    }

    /// Register a pre-existing container (for exec and reuse scenarios).
    pub fn seed_container(&self, id: &str, running: bool) {
        let (done_tx, _) = watch::channel(if running { None } else { Some(0) });
        let mut state = self.state.lock();
        state.containers.insert(
            id.to_string(),
            MockContainer {
                name: None,
                config: ContainerConfig::default(),
                running,
                exit_code: if running { None } else { Some(0) },
                logs: Vec::new(),
                done_tx,
            },
        );
    }

    /// Mark a container exited and notify waiters plus the event stream.
    pub fn finish_container(&self, id: &str, exit_code: i64) {
        {
            let mut state = self.state.lock();
            if let Some(container) = state.containers.get_mut(id) {
                container.running = false;
                container.exit_code = Some(exit_code);
                let _ = container.done_tx.send(Some(exit_code));
            }
        }
        let _ = self.events_tx.send(ProviderEvent {
            container_id: id.to_string(),
            action: "die".to_string(),
            exit_code: Some(exit_code),
        });
    }
}

#[async_trait]
impl ContainerProvider for MockProvider {
    async fn create_container(
        &self,
        config: &ContainerConfig,
        name: Option<&str>,
    ) -> Result<String, ProviderError> {
        self.record("create_container");
        let id = format!("ctr-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        let (done_tx, _) = watch::channel(None);
        let mut state = self.state.lock();
        let logs = state.default_logs.clone();
        state.containers.insert(
            id.clone(),
            MockContainer {
                name: name.map(|n| n.to_string()),
                config: config.clone(),
                running: false,
                exit_code: None,
                logs,
                done_tx,
            },
        );
        state.created_order.push(id.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), ProviderError> {
        self.record("start_container");
        {
            let mut state = self.state.lock();
            let container = state.containers.get_mut(id).ok_or_else(|| {
                ProviderError::ContainerNotFound { id: id.to_string() }
            })?;
            container.running = true;
        }
        if let Some(exit_code) = *self.auto_finish.lock() {
            self.finish_container(id, exit_code);
        }
        Ok(())
    }

    async fn stop_container(
        &self,
        id: &str,
        _timeout: Option<Duration>,
    ) -> Result<(), ProviderError> {
        self.record("stop_container");
        self.finish_container(id, 137);
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), ProviderError> {
        self.record("remove_container");
        let mut state = self.state.lock();
        if state.containers.remove(id).is_none() {
            return Err(ProviderError::ContainerNotFound { id: id.to_string() });
        }
        state.removed.push((id.to_string(), force));
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, ProviderError> {
        self.record("inspect_container");
        let state = self.state.lock();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| ProviderError::ContainerNotFound { id: id.to_string() })?;
        Ok(ContainerState {
            running: container.running,
            exit_code: container.exit_code,
            status: if container.running {
                "running".to_string()
            } else {
                "exited".to_string()
            },
        })
    }

    async fn wait_container(&self, id: &str) -> Result<i64, ProviderError> {
        self.record("wait_container");
        let mut rx = {
            let state = self.state.lock();
            let container = state
                .containers
                .get(id)
                .ok_or_else(|| ProviderError::ContainerNotFound { id: id.to_string() })?;
            container.done_tx.subscribe()
        };
        loop {
            if let Some(code) = *rx.borrow() {
                return Ok(code);
            }
            if rx.changed().await.is_err() {
                return Err(ProviderError::operation(
                    "wait container",
                    id,
                    "container dropped",
                ));
            }
        }
    }

    async fn container_logs(
        &self,
        id: &str,
        options: LogsOptions,
    ) -> Result<BoxStream<'static, Result<LogChunk, ProviderError>>, ProviderError> {
        self.record("container_logs");
        let state = self.state.lock();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| ProviderError::ContainerNotFound { id: id.to_string() })?;
        let chunks: Vec<_> = container
            .logs
            .iter()
            .filter(|chunk| match chunk.kind {
                LogStreamKind::Stdout => options.stdout,
                LogStreamKind::Stderr => options.stderr,
            })
            .cloned()
            .map(Ok)
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn create_exec(
        &self,
        container: &str,
        _config: &ExecConfig,
    ) -> Result<String, ProviderError> {
        self.record("create_exec");
        if !self.state.lock().containers.contains_key(container) {
            return Err(ProviderError::ContainerNotFound {
                id: container.to_string(),
            });
        }
        Ok(format!("exec-{}", self.counter.fetch_add(1, Ordering::SeqCst)))
    }

    async fn start_exec(
        &self,
        _exec_id: &str,
    ) -> Result<BoxStream<'static, Result<LogChunk, ProviderError>>, ProviderError> {
        self.record("start_exec");
        Ok(futures::stream::empty().boxed())
    }

    async fn inspect_exec(&self, _exec_id: &str) -> Result<ExecStatus, ProviderError> {
        self.record("inspect_exec");
        Ok(ExecStatus {
            running: false,
            exit_code: Some(0),
            pid: 1,
        })
    }

    async fn run_exec(
        &self,
        container: &str,
        config: &ExecConfig,
        stdout: SharedBuffer,
        stderr: SharedBuffer,
    ) -> Result<i64, ProviderError> {
        self.record("run_exec");
        let result = {
            let mut state = self.state.lock();
            if !state.containers.contains_key(container) {
                return Err(ProviderError::ContainerNotFound {
                    id: container.to_string(),
                });
            }
            state
                .execs
                .push((container.to_string(), config.clone()));
            state.exec_results.pop_front().unwrap_or(MockExecResult {
                exit_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        };
        stdout.write(&result.stdout);
        stderr.write(&result.stderr);
        Ok(result.exit_code)
    }

    async fn pull_image(&self, reference: &str) -> Result<(), ProviderError> {
        self.record("pull_image");
        let mut state = self.state.lock();
        if let Some(reason) = &state.pull_failure {
            return Err(ProviderError::ImagePullFailed {
                reference: reference.to_string(),
                reason: reason.clone(),
            });
        }
        state.pulled.push(reference.to_string());
        state.local_images.insert(reference.to_string());
        Ok(())
    }

    async fn has_image_locally(&self, reference: &str) -> Result<bool, ProviderError> {
        self.record("has_image_locally");
        Ok(self.state.lock().local_images.contains(reference))
    }

    async fn connect_network(
        &self,
        network_id: &str,
        container_id: &str,
    ) -> Result<(), ProviderError> {
        self.record("connect_network");
        self.state
            .lock()
            .connected
            .push((network_id.to_string(), container_id.to_string()));
        Ok(())
    }

    async fn find_networks_by_name(
        &self,
        name: &str,
    ) -> Result<Vec<NetworkInfo>, ProviderError> {
        self.record("find_networks_by_name");
        Ok(self
            .state
            .lock()
            .networks
            .iter()
            .filter(|n| n.name == name)
            .cloned()
            .collect())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, ProviderError> {
        self.record("create_service");
        let id = format!("svc-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.state.lock().services.insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn list_service_tasks(
        &self,
        service_id: &str,
    ) -> Result<Vec<TaskStatus>, ProviderError> {
        self.record("list_service_tasks");
        let mut state = self.state.lock();
        if !state.services.contains_key(service_id) {
            return Err(ProviderError::ServiceNotFound {
                id: service_id.to_string(),
            });
        }
        Ok(state.service_tasks.pop_front().unwrap_or_default())
    }

    async fn remove_service(&self, service_id: &str) -> Result<(), ProviderError> {
        self.record("remove_service");
        let mut state = self.state.lock();
        if state.services.remove(service_id).is_none() {
            return Err(ProviderError::ServiceNotFound {
                id: service_id.to_string(),
            });
        }
        state.removed_services.push(service_id.to_string());
        Ok(())
    }

    async fn subscribe_events(
        &self,
        filter: EventFilter,
    ) -> Result<BoxStream<'static, Result<ProviderEvent, ProviderError>>, ProviderError> {
        self.record("subscribe_events");
        if !self.events_supported.load(Ordering::SeqCst) {
            return Err(ProviderError::operation(
                "subscribe events",
                "daemon",
                "event stream unsupported",
            ));
        }
        let rx = self.events_tx.subscribe();
        let wanted = filter.container_id;
        let stream = futures::stream::unfold((rx, wanted), |(mut rx, wanted)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(id) = &wanted {
                            if &event.container_id != id {
                                continue;
                            }
                        }
                        return Some((Ok(event), (rx, wanted)));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed();
        Ok(stream)
    }

    async fn info(&self) -> Result<SystemInfo, ProviderError> {
        self.record("info");
        Ok(SystemInfo {
            name: "mock".to_string(),
            server_version: "0.0.0".to_string(),
            containers: self.state.lock().containers.len() as u64,
        })
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        self.record("ping");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_image_uses_local_copy_without_pulling() {
        let provider = MockProvider::new();
        provider.add_local_image("alpine:latest");
        provider.ensure_image("alpine:latest", false).await.unwrap();
        assert!(provider.pulled_images().is_empty());
    }

    #[tokio::test]
    async fn ensure_image_pulls_on_local_miss() {
        let provider = MockProvider::new();
        provider.ensure_image("alpine:latest", false).await.unwrap();
        assert_eq!(provider.pulled_images(), vec!["alpine:latest"]);
    }

    #[tokio::test]
    async fn ensure_image_force_pull_hits_the_registry() {
        let provider = MockProvider::new();
        provider.add_local_image("alpine:latest");
        provider.ensure_image("alpine:latest", true).await.unwrap();
        assert_eq!(provider.pulled_images(), vec!["alpine:latest"]);
    }

    #[tokio::test]
    async fn ensure_image_surfaces_pull_failure() {
        let provider = MockProvider::new();
        provider.set_pull_failure("registry unavailable");
        let err = provider
            .ensure_image("alpine:latest", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ImagePullFailed { .. }));
    }

    #[tokio::test]
    async fn wait_container_resolves_on_finish() {
        let provider = Arc::new(MockProvider::new());
        let id = provider
            .create_container(&ContainerConfig::default(), None)
            .await
            .unwrap();
        provider.start_container(&id).await.unwrap();

        let waiter = {
            let provider = provider.clone();
            let id = id.clone();
            tokio::spawn(async move { provider.wait_container(&id).await })
        };
        tokio::task::yield_now().await;
        provider.finish_container(&id, 3);
        assert_eq!(waiter.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn event_stream_filters_by_container() {
        let provider = MockProvider::new();
        provider.seed_container("a", true);
        provider.seed_container("b", true);

        let mut stream = provider
            .subscribe_events(EventFilter {
                container_id: Some("a".to_string()),
            })
            .await
            .unwrap();

        provider.finish_container("b", 0);
        provider.finish_container("a", 7);

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.container_id, "a");
        assert_eq!(event.exit_code, Some(7));
    }
}
