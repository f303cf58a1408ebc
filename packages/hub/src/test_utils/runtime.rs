use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use runnerhub_types::{ContainerId, ContainerSpec};

use crate::runtime::{
    ContainerInfo, ContainerRuntime, ExecOutput, NetworkSpec, RawStats, RuntimeError,
    RuntimeResult,
};

#[derive(Debug, Clone, PartialEq)]
enum MockState {
    Created,
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
struct MockContainer {
    state: MockState,
    exit_code: Option<i64>,
    networks: BTreeSet<String>,
    stats: RawStats,
    logs: Vec<String>,
    killed_externally: bool,
}

impl MockContainer {
    fn new() -> Self {
        Self {
            state: MockState::Created,
            exit_code: None,
            networks: ["bridge".to_string()].into(),
            stats: RawStats::default(),
            logs: vec!["runner boot".to_string()],
            killed_externally: false,
        }
    }
}

#[derive(Debug, Clone)]
struct MockNetwork {
    id: String,
    spec: NetworkSpec,
}

#[derive(Default)]
struct MockInner {
    containers: HashMap<String, MockContainer>,
    networks: HashMap<String, MockNetwork>,
    fail_next_start: bool,
    fail_stop_for: BTreeSet<String>,
}

/// In-memory stand-in for the container runtime, with failure injection for
/// the error paths.
pub struct MockRuntime {
    inner: Mutex<MockInner>,
    next_id: AtomicU64,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockInner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a pre-existing container outside the create path.
    pub async fn seed_container(&self, id: &str) -> ContainerId {
        let mut inner = self.inner.lock().await;
        inner.containers.insert(id.to_string(), MockContainer::new());
        ContainerId::new(id)
    }

    pub async fn is_running(&self, id: &ContainerId) -> bool {
        let inner = self.inner.lock().await;
        inner
            .containers
            .get(id.as_ref())
            .map(|c| c.state == MockState::Running)
            .unwrap_or(false)
    }

    pub async fn fail_next_start(&self) {
        self.inner.lock().await.fail_next_start = true;
    }

    pub async fn fail_stop_for(&self, id: &ContainerId) {
        self.inner
            .lock()
            .await
            .fail_stop_for
            .insert(id.to_string());
    }

    pub async fn set_stats(&self, id: &ContainerId, stats: RawStats) {
        if let Some(container) = self.inner.lock().await.containers.get_mut(id.as_ref()) {
            container.stats = stats;
        }
    }

    pub async fn set_exit_code(&self, id: &ContainerId, code: i64) {
        if let Some(container) = self.inner.lock().await.containers.get_mut(id.as_ref()) {
            container.exit_code = Some(code);
        }
    }

    pub async fn set_logs(&self, id: &ContainerId, lines: Vec<String>) {
        if let Some(container) = self.inner.lock().await.containers.get_mut(id.as_ref()) {
            container.logs = lines;
        }
    }

    /// Simulate the process dying outside lifecycle control.
    pub async fn kill_externally(&self, id: &ContainerId, exit_code: i64) {
        if let Some(container) = self.inner.lock().await.containers.get_mut(id.as_ref()) {
            container.state = MockState::Stopped;
            container.exit_code = Some(exit_code);
            container.killed_externally = true;
        }
    }

    pub async fn network_names(&self) -> Vec<String> {
        self.inner.lock().await.networks.keys().cloned().collect()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_container(
        &self,
        spec: &ContainerSpec,
        _network_mode: Option<&str>,
    ) -> RuntimeResult<ContainerId> {
        let mut inner = self.inner.lock().await;
        let id = format!(
            "mock-{}-{}",
            spec.name,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        inner.containers.insert(id.clone(), MockContainer::new());
        Ok(ContainerId::new(id))
    }

    async fn start_container(&self, id: &ContainerId) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.fail_next_start {
            inner.fail_next_start = false;
            return Err(RuntimeError::Failed("injected start failure".to_string()));
        }
        let container = inner
            .containers
            .get_mut(id.as_ref())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.state = MockState::Running;
        Ok(())
    }

    async fn stop_container(&self, id: &ContainerId, _grace_s: u64) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.fail_stop_for.contains(id.as_ref()) {
            return Err(RuntimeError::Failed("injected stop failure".to_string()));
        }
        let container = inner
            .containers
            .get_mut(id.as_ref())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.state = MockState::Stopped;
        if container.exit_code.is_none() {
            container.exit_code = Some(0);
        }
        Ok(())
    }

    async fn remove_container(&self, id: &ContainerId, _force: bool) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().await;
        let removed = inner.containers.remove(id.as_ref());
        // also detach from any network membership
        if removed.is_some() {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(id.to_string()))
        }
    }

    async fn exec(&self, id: &ContainerId, cmd: &[String]) -> RuntimeResult<ExecOutput> {
        let inner = self.inner.lock().await;
        let container = inner
            .containers
            .get(id.as_ref())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if container.state != MockState::Running {
            return Err(RuntimeError::Conflict("container is not running".to_string()));
        }
        Ok(ExecOutput {
            stdout: format!("ran: {}", cmd.join(" ")),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn stats(&self, id: &ContainerId) -> RuntimeResult<RawStats> {
        let inner = self.inner.lock().await;
        inner
            .containers
            .get(id.as_ref())
            .map(|c| c.stats)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn logs(&self, id: &ContainerId, tail: usize) -> RuntimeResult<Vec<String>> {
        let inner = self.inner.lock().await;
        let container = inner
            .containers
            .get(id.as_ref())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let lines = &container.logs;
        Ok(lines[lines.len().saturating_sub(tail)..].to_vec())
    }

    async fn inspect(&self, id: &ContainerId) -> RuntimeResult<ContainerInfo> {
        let inner = self.inner.lock().await;
        let container = inner
            .containers
            .get(id.as_ref())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        Ok(ContainerInfo {
            running: container.state == MockState::Running,
            exit_code: container.exit_code,
            networks: container.networks.iter().cloned().collect(),
        })
    }

    async fn create_network(&self, spec: &NetworkSpec) -> RuntimeResult<String> {
        let mut inner = self.inner.lock().await;
        if inner.networks.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict(format!(
                "network {} exists",
                spec.name
            )));
        }
        let id = format!("mocknet-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        inner.networks.insert(
            spec.name.clone(),
            MockNetwork {
                id: id.clone(),
                spec: spec.clone(),
            },
        );
        Ok(id)
    }

    async fn remove_network(&self, name: &str) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().await;
        let attached = inner
            .containers
            .values()
            .any(|c| c.networks.contains(name));
        if attached {
            return Err(RuntimeError::Conflict(format!(
                "network {name} has attached containers"
            )));
        }
        inner
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }

    async fn connect_network(&self, network: &str, container: &ContainerId) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.networks.contains_key(network) {
            return Err(RuntimeError::NotFound(network.to_string()));
        }
        let container = inner
            .containers
            .get_mut(container.as_ref())
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))?;
        container.networks.insert(network.to_string());
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &ContainerId,
        _force: bool,
    ) -> RuntimeResult<()> {
        let mut inner = self.inner.lock().await;
        let container = inner
            .containers
            .get_mut(container.as_ref())
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))?;
        if !container.networks.remove(network) {
            return Err(RuntimeError::NotFound(format!(
                "container not attached to {network}"
            )));
        }
        Ok(())
    }

    async fn network_containers(&self, network: &str) -> RuntimeResult<Vec<String>> {
        let inner = self.inner.lock().await;
        if !inner.networks.contains_key(network) {
            return Err(RuntimeError::NotFound(network.to_string()));
        }
        Ok(inner
            .containers
            .iter()
            .filter(|(_, c)| c.networks.contains(network))
            .map(|(id, _)| id.clone())
            .collect())
    }
}

impl MockRuntime {
    /// Subnet the mock recorded for a network name, for isolation assertions.
    pub async fn network_subnet(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .networks
            .get(name)
            .map(|n| n.spec.subnet.clone())
    }

    pub async fn network_id(&self, name: &str) -> Option<String> {
        self.inner.lock().await.networks.get(name).map(|n| n.id.clone())
    }
}
