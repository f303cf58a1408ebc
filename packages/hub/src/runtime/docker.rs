use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StatsOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, Ipam, IpamConfig};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions,
};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;

use runnerhub_types::{ContainerId, ContainerSpec};

use super::{ContainerInfo, ContainerRuntime, ExecOutput, NetworkSpec, RawStats, RuntimeError, RuntimeResult};

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        match &err {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => match *status_code {
                404 => RuntimeError::NotFound(message.clone()),
                409 => RuntimeError::Conflict(message.clone()),
                _ => RuntimeError::Failed(message.clone()),
            },
            _ => RuntimeError::Unavailable(err.to_string()),
        }
    }
}

/// Docker Engine API implementation of the runtime seam.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(
        &self,
        spec: &ContainerSpec,
        network_mode: Option<&str>,
    ) -> RuntimeResult<ContainerId> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let host_config = HostConfig {
            memory: Some(spec.resources.mem_limit_bytes as i64),
            nano_cpus: Some((spec.resources.cpu_limit * 1_000_000_000.0) as i64),
            pids_limit: Some(spec.resources.pids_limit as i64),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            readonly_rootfs: Some(spec.read_only_root),
            network_mode: network_mode.map(str::to_string),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                Config {
                    image: Some(spec.image.clone()),
                    env: Some(env),
                    labels: Some(labels),
                    host_config: Some(host_config),
                    ..Default::default()
                },
            )
            .await?;

        Ok(ContainerId::new(response.id))
    }

    async fn start_container(&self, id: &ContainerId) -> RuntimeResult<()> {
        self.docker
            .start_container::<String>(id.as_ref(), None)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &ContainerId, grace_s: u64) -> RuntimeResult<()> {
        self.docker
            .stop_container(id.as_ref(), Some(StopContainerOptions { t: grace_s as i64 }))
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &ContainerId, force: bool) -> RuntimeResult<()> {
        self.docker
            .remove_container(
                id.as_ref(),
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn exec(&self, id: &ContainerId, cmd: &[String]) -> RuntimeResult<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                id.as_ref(),
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    bollard::container::LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    bollard::container::LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }

    async fn stats(&self, id: &ContainerId) -> RuntimeResult<RawStats> {
        let mut stream = self.docker.stats(
            id.as_ref(),
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );

        let stats = stream
            .next()
            .await
            .ok_or_else(|| RuntimeError::Failed(format!("no stats for {id}")))??;

        let (rx, tx) = stats
            .networks
            .as_ref()
            .map(|nets| {
                nets.values()
                    .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or((0, 0));

        let (block_read, block_write) = stats
            .blkio_stats
            .io_service_bytes_recursive
            .as_ref()
            .map(|entries| {
                entries.iter().fold((0u64, 0u64), |(r, w), entry| {
                    match entry.op.to_ascii_lowercase().as_str() {
                        "read" => (r + entry.value, w),
                        "write" => (r, w + entry.value),
                        _ => (r, w),
                    }
                })
            })
            .unwrap_or((0, 0));

        Ok(RawStats {
            cpu_total_ns: stats.cpu_stats.cpu_usage.total_usage,
            system_cpu_ns: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus: stats.cpu_stats.online_cpus.unwrap_or(1) as u32,
            mem_usage_bytes: stats.memory_stats.usage.unwrap_or(0),
            mem_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
            rx_bytes: rx,
            tx_bytes: tx,
            block_read_bytes: block_read,
            block_write_bytes: block_write,
        })
    }

    async fn logs(&self, id: &ContainerId, tail: usize) -> RuntimeResult<Vec<String>> {
        let mut stream = self.docker.logs(
            id.as_ref(),
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for line in String::from_utf8_lossy(&chunk.into_bytes()).lines() {
                lines.push(line.to_string());
            }
        }
        Ok(lines)
    }

    async fn inspect(&self, id: &ContainerId) -> RuntimeResult<ContainerInfo> {
        let response = self.docker.inspect_container(id.as_ref(), None).await?;

        let (running, exit_code) = response
            .state
            .map(|state| {
                (
                    state.running.unwrap_or(false),
                    state.exit_code.filter(|_| !state.running.unwrap_or(false)),
                )
            })
            .unwrap_or((false, None));

        let networks = response
            .network_settings
            .and_then(|settings| settings.networks)
            .map(|nets| nets.into_keys().collect())
            .unwrap_or_default();

        Ok(ContainerInfo {
            running,
            exit_code,
            networks,
        })
    }

    async fn create_network(&self, spec: &NetworkSpec) -> RuntimeResult<String> {
        // internal bridge with masquerade off; workloads get no external
        // routing and no inter-network reach
        let options: HashMap<String, String> = [(
            "com.docker.network.bridge.enable_ip_masquerade".to_string(),
            "false".to_string(),
        )]
        .into();

        let response = self
            .docker
            .create_network(CreateNetworkOptions {
                name: spec.name.clone(),
                driver: "bridge".to_string(),
                internal: spec.internal,
                ipam: Ipam {
                    driver: Some("default".to_string()),
                    config: Some(vec![IpamConfig {
                        subnet: Some(spec.subnet.clone()),
                        gateway: Some(spec.gateway.clone()),
                        ..Default::default()
                    }]),
                    options: None,
                },
                options,
                labels: spec
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                ..Default::default()
            })
            .await?;

        response
            .id
            .ok_or_else(|| RuntimeError::Failed("docker returned no network id".to_string()))
    }

    async fn remove_network(&self, name: &str) -> RuntimeResult<()> {
        self.docker.remove_network(name).await?;
        Ok(())
    }

    async fn connect_network(&self, network: &str, container: &ContainerId) -> RuntimeResult<()> {
        self.docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: container.to_string(),
                    endpoint_config: Default::default(),
                },
            )
            .await?;
        Ok(())
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &ContainerId,
        force: bool,
    ) -> RuntimeResult<()> {
        self.docker
            .disconnect_network(
                network,
                DisconnectNetworkOptions {
                    container: container.to_string(),
                    force,
                },
            )
            .await?;
        Ok(())
    }

    async fn network_containers(&self, network: &str) -> RuntimeResult<Vec<String>> {
        let response = self
            .docker
            .inspect_network(network, None::<InspectNetworkOptions<String>>)
            .await?;

        Ok(response
            .containers
            .map(|containers| containers.into_keys().collect())
            .unwrap_or_default())
    }
}
