pub mod docker;

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

use runnerhub_types::{Classify, ContainerId, ContainerSpec, ErrorCode};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("runtime operation failed: {0}")]
    Failed(String),
}

impl Classify for RuntimeError {
    fn code(&self) -> ErrorCode {
        match self {
            RuntimeError::Unavailable(_) => ErrorCode::Unavailable,
            RuntimeError::NotFound(_) => ErrorCode::NotFound,
            RuntimeError::Conflict(_) => ErrorCode::Conflict,
            RuntimeError::Failed(_) => ErrorCode::Transient,
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// A raw counter snapshot from the runtime. Rates come from differencing two
/// successive snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawStats {
    pub cpu_total_ns: u64,
    pub system_cpu_ns: u64,
    pub online_cpus: u32,
    pub mem_usage_bytes: u64,
    pub mem_limit_bytes: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerInfo {
    pub running: bool,
    pub exit_code: Option<i64>,
    /// Names of networks the container is attached to
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSpec {
    pub name: String,
    pub subnet: String,
    pub gateway: String,
    pub internal: bool,
    pub labels: BTreeMap<String, String>,
}

/// The runtime seam. The hub assumes nothing about the runtime beyond this
/// surface; production uses the Docker Engine API, tests an in-memory fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create_container(
        &self,
        spec: &ContainerSpec,
        network_mode: Option<&str>,
    ) -> RuntimeResult<ContainerId>;

    async fn start_container(&self, id: &ContainerId) -> RuntimeResult<()>;

    async fn stop_container(&self, id: &ContainerId, grace_s: u64) -> RuntimeResult<()>;

    async fn remove_container(&self, id: &ContainerId, force: bool) -> RuntimeResult<()>;

    async fn exec(&self, id: &ContainerId, cmd: &[String]) -> RuntimeResult<ExecOutput>;

    async fn stats(&self, id: &ContainerId) -> RuntimeResult<RawStats>;

    async fn logs(&self, id: &ContainerId, tail: usize) -> RuntimeResult<Vec<String>>;

    async fn inspect(&self, id: &ContainerId) -> RuntimeResult<ContainerInfo>;

    /// Returns the runtime-side network id.
    async fn create_network(&self, spec: &NetworkSpec) -> RuntimeResult<String>;

    async fn remove_network(&self, name: &str) -> RuntimeResult<()>;

    async fn connect_network(&self, network: &str, container: &ContainerId) -> RuntimeResult<()>;

    async fn disconnect_network(
        &self,
        network: &str,
        container: &ContainerId,
        force: bool,
    ) -> RuntimeResult<()>;

    /// Container ids currently attached to the named network.
    async fn network_containers(&self, network: &str) -> RuntimeResult<Vec<String>>;
}
