pub mod cleanup;
pub mod sampler;

use chrono::Utc;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

use runnerhub_types::{
    Classify, ContainerId, ContainerRecord, ContainerSpec, ContainerState, ErrorCode, MonitorEvent,
    ResourceSample,
};
use utils::lock::KeyedMutex;
use utils::telemetry::LifecycleMetrics;

use crate::runtime::{ContainerRuntime, ExecOutput, RawStats, RuntimeError};
use crate::storage::{Store, StoreError};
use crate::subsystems::monitor::MonitorBus;
use crate::subsystems::network::{NetworkError, NetworkIsolator};

pub use cleanup::{CleanupConfig, CleanupPolicy};
pub use sampler::SamplerConfig;

/// Lines captured from a container at STOPPED for archival.
const ARCHIVE_TAIL_LINES: usize = 1000;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("exec forbidden: container {id} is {state:?}, not running")]
    ExecForbidden {
        id: ContainerId,
        state: ContainerState,
    },

    #[error("log archive failed: {0}")]
    Archive(String),
}

impl Classify for LifecycleError {
    fn code(&self) -> ErrorCode {
        match self {
            LifecycleError::Store(e) => e.code(),
            LifecycleError::Runtime(e) => e.code(),
            LifecycleError::Network(e) => e.code(),
            LifecycleError::ExecForbidden { .. } => ErrorCode::StateError,
            LifecycleError::Archive(_) => ErrorCode::Transient,
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub sampler: SamplerConfig,
    pub cleanup: CleanupConfig,
    /// Where stopped containers' log tails are archived
    pub archive_dir: PathBuf,
    pub default_stop_grace_s: u64,
}

/// Owns every container state transition. Per-container ordering comes from a
/// keyed mutex; nothing else mutates the runtime for a given container.
pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: Store,
    network: Arc<NetworkIsolator>,
    bus: Arc<MonitorBus>,
    metrics: LifecycleMetrics,
    config: LifecycleConfig,
    locks: KeyedMutex<ContainerId>,
    /// Last raw counter snapshot per container, for rate differencing
    raw_samples: DashMap<ContainerId, RawStats>,
    /// Consecutive over-threshold strikes per container (cpu, mem)
    strikes: DashMap<ContainerId, (u8, u8)>,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Store,
        network: Arc<NetworkIsolator>,
        bus: Arc<MonitorBus>,
        metrics: LifecycleMetrics,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            network,
            bus,
            metrics,
            config,
            locks: KeyedMutex::new(),
            raw_samples: DashMap::new(),
            strikes: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn network(&self) -> &Arc<NetworkIsolator> {
        &self.network
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        self.config.sampler
    }

    /// Compose and create the container. The record exists from CREATING on;
    /// the container is CREATED once the runtime call returns.
    #[instrument(level = "debug", skip(self, spec), fields(subsys = "Lifecycle", name = %spec.name))]
    pub async fn create(&self, spec: &ContainerSpec) -> LifecycleResult<ContainerRecord> {
        let id = self.runtime.create_container(spec, None).await?;
        let _guard = self.locks.lock(id.clone()).await;

        let record = ContainerRecord {
            id: id.clone(),
            job_id: spec.job_id,
            runner_id: spec.runner_id,
            repository: spec.repository.clone(),
            image: spec.image.clone(),
            state: ContainerState::Creating,
            resources: spec.resources,
            labels: spec.labels.clone(),
            network_id: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            last_sample: None,
            last_sampled_at: None,
            healthy: true,
        };
        self.store.insert_container(&record).await?;
        self.store
            .transition_container(&id, ContainerState::Created)
            .await?;
        self.publish_state(&id, ContainerState::Created);

        Ok(ContainerRecord {
            state: ContainerState::Created,
            ..record
        })
    }

    #[instrument(level = "debug", skip(self), fields(subsys = "Lifecycle"))]
    pub async fn start(&self, id: &ContainerId) -> LifecycleResult<()> {
        let _guard = self.locks.lock(id.clone()).await;

        self.store
            .transition_container(id, ContainerState::Starting)
            .await?;
        if let Err(err) = self.runtime.start_container(id).await {
            self.store
                .transition_container(id, ContainerState::Error)
                .await?;
            self.publish_state(id, ContainerState::Error);
            return Err(err.into());
        }
        self.store
            .transition_container(id, ContainerState::Running)
            .await?;
        self.metrics.containers_running.add(1, &[]);
        self.publish_state(id, ContainerState::Running);
        Ok(())
    }

    /// Honors the grace period, then the runtime force-kills.
    #[instrument(level = "debug", skip(self), fields(subsys = "Lifecycle"))]
    pub async fn stop(&self, id: &ContainerId, grace_s: Option<u64>) -> LifecycleResult<()> {
        let _guard = self.locks.lock(id.clone()).await;
        self.stop_locked(id, grace_s).await
    }

    async fn stop_locked(&self, id: &ContainerId, grace_s: Option<u64>) -> LifecycleResult<()> {
        let grace = grace_s.unwrap_or(self.config.default_stop_grace_s);

        self.store
            .transition_container(id, ContainerState::Stopping)
            .await?;
        if let Err(err) = self.runtime.stop_container(id, grace).await {
            self.store
                .transition_container(id, ContainerState::Error)
                .await?;
            self.publish_state(id, ContainerState::Error);
            return Err(err.into());
        }
        self.store
            .transition_container(id, ContainerState::Stopped)
            .await?;
        self.metrics.containers_running.add(-1, &[]);
        self.publish_state(id, ContainerState::Stopped);

        if let Ok(info) = self.runtime.inspect(id).await {
            if let Some(exit_code) = info.exit_code {
                self.store.set_container_exit_code(id, exit_code).await?;
            }
        }
        if let Err(err) = self.archive_logs(id).await {
            tracing::warn!("Log archive failed for {}: {}", id, err);
        }
        Ok(())
    }

    /// Detaches the network, removes the container, and deletes the record
    /// last. With `force`, a still-running container is stopped first.
    #[instrument(level = "debug", skip(self), fields(subsys = "Lifecycle"))]
    pub async fn remove(&self, id: &ContainerId, force: bool) -> LifecycleResult<()> {
        let _guard = self.locks.lock(id.clone()).await;

        let record = self.store.get_container(id).await?;
        if record.state == ContainerState::Running {
            if !force {
                return Err(LifecycleError::Store(StoreError::IllegalTransition(
                    format!("container {id} is running; stop it or pass force"),
                )));
            }
            self.stop_locked(id, Some(0)).await?;
        } else if record.state == ContainerState::Error && record.started_at.is_some() {
            // anything that reached RUNNING passes through STOPPED before
            // removal, even when the graceful stop already failed
            match self.runtime.stop_container(id, 0).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(err) => tracing::debug!("Force kill before removal of {}: {}", id, err),
            }
            self.store
                .transition_container(id, ContainerState::Stopped)
                .await?;
            self.publish_state(id, ContainerState::Stopped);
            if let Err(err) = self.archive_logs(id).await {
                tracing::debug!("Log archive during removal skipped for {}: {}", id, err);
            }
        }

        if let Err(err) = self.network.detach(id, &record.repository).await {
            tracing::debug!("Network detach during remove skipped for {}: {}", id, err);
        }

        self.store
            .transition_container(id, ContainerState::Removing)
            .await?;
        match self.runtime.remove_container(id, force).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(err) => {
                self.store
                    .transition_container(id, ContainerState::Error)
                    .await?;
                self.publish_state(id, ContainerState::Error);
                return Err(err.into());
            }
        }
        self.store
            .transition_container(id, ContainerState::Removed)
            .await?;
        self.publish_state(id, ContainerState::Removed);

        self.raw_samples.remove(id);
        self.strikes.remove(id);
        self.store.delete_container(id).await?;
        Ok(())
    }

    /// Forbidden unless the container is RUNNING.
    #[instrument(level = "debug", skip(self, cmd), fields(subsys = "Lifecycle"))]
    pub async fn exec(&self, id: &ContainerId, cmd: &[String]) -> LifecycleResult<ExecOutput> {
        let record = self.store.get_container(id).await?;
        if record.state != ContainerState::Running {
            return Err(LifecycleError::ExecForbidden {
                id: id.clone(),
                state: record.state,
            });
        }
        Ok(self.runtime.exec(id, cmd).await?)
    }

    /// One sampled reading, produced by differencing successive raw runtime
    /// counters. CPU: `(container_delta / system_delta) * online_cpus * 100`.
    #[instrument(level = "debug", skip(self), fields(subsys = "Lifecycle"))]
    pub async fn stats(&self, id: &ContainerId) -> LifecycleResult<ResourceSample> {
        let raw = self.runtime.stats(id).await?;

        let sample = match self.raw_samples.get(id).map(|prev| *prev) {
            Some(prev) => diff_samples(&prev, &raw),
            None => ResourceSample {
                mem_bytes: raw.mem_usage_bytes,
                mem_pct: mem_pct(&raw),
                ..Default::default()
            },
        };
        self.raw_samples.insert(id.clone(), raw);

        let now = Utc::now();
        self.store.set_container_sample(id, &sample, now).await?;
        if let Ok(record) = self.store.get_container(id).await {
            if let Some(runner_id) = record.runner_id {
                self.store.heartbeat_runner(runner_id, now).await?;
            }
        }
        Ok(sample)
    }

    pub async fn logs(&self, id: &ContainerId, tail: Option<usize>) -> LifecycleResult<Vec<String>> {
        Ok(self
            .runtime
            .logs(id, tail.unwrap_or(ARCHIVE_TAIL_LINES))
            .await?)
    }

    /// Record a stop the lifecycle did not drive: the runtime reports the
    /// container exited on its own. The observed stop goes through the
    /// regular STOPPING/STOPPED states so removal invariants hold.
    async fn mark_exited(&self, id: &ContainerId, exit_code: Option<i64>) -> LifecycleResult<()> {
        let _guard = self.locks.lock(id.clone()).await;

        self.store
            .transition_container(id, ContainerState::Stopping)
            .await?;
        self.store
            .transition_container(id, ContainerState::Stopped)
            .await?;
        self.metrics.containers_running.add(-1, &[]);
        self.publish_state(id, ContainerState::Stopped);

        if let Some(exit_code) = exit_code {
            self.store.set_container_exit_code(id, exit_code).await?;
        }
        self.store.set_container_health(id, false).await?;
        if let Err(err) = self.archive_logs(id).await {
            tracing::warn!("Log archive failed for exited {}: {}", id, err);
        }
        Ok(())
    }

    async fn archive_logs(&self, id: &ContainerId) -> LifecycleResult<()> {
        let lines = self.runtime.logs(id, ARCHIVE_TAIL_LINES).await?;
        if lines.is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.config.archive_dir)
            .await
            .map_err(|e| LifecycleError::Archive(e.to_string()))?;
        let path = self.config.archive_dir.join(format!("{}.log", id));
        tokio::fs::write(&path, lines.join("\n"))
            .await
            .map_err(|e| LifecycleError::Archive(e.to_string()))?;
        tracing::debug!("Archived {} log lines to {}", lines.len(), path.display());
        Ok(())
    }

    fn publish_state(&self, id: &ContainerId, state: ContainerState) {
        self.bus.publish(MonitorEvent::ContainerState {
            container_id: id.clone(),
            state,
        });
    }
}

fn mem_pct(raw: &RawStats) -> f64 {
    if raw.mem_limit_bytes == 0 {
        0.0
    } else {
        raw.mem_usage_bytes as f64 / raw.mem_limit_bytes as f64 * 100.0
    }
}

fn diff_samples(prev: &RawStats, raw: &RawStats) -> ResourceSample {
    let cpu_delta = raw.cpu_total_ns.saturating_sub(prev.cpu_total_ns) as f64;
    let system_delta = raw.system_cpu_ns.saturating_sub(prev.system_cpu_ns) as f64;
    let cpu_pct = if system_delta > 0.0 {
        (cpu_delta / system_delta) * raw.online_cpus as f64 * 100.0
    } else {
        0.0
    };

    ResourceSample {
        cpu_pct,
        mem_pct: mem_pct(raw),
        mem_bytes: raw.mem_usage_bytes,
        rx_bytes: raw.rx_bytes.saturating_sub(prev.rx_bytes),
        tx_bytes: raw.tx_bytes.saturating_sub(prev.tx_bytes),
        block_read_bytes: raw.block_read_bytes.saturating_sub(prev.block_read_bytes),
        block_write_bytes: raw.block_write_bytes.saturating_sub(prev.block_write_bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::lifecycle::{sample_spec, test_manager};
    use runnerhub_types::Repository;

    #[tokio::test]
    async fn create_start_stop_remove_path() {
        let (manager, runtime, _dir) = test_manager().await;
        let spec = sample_spec("org/repo1");

        let record = manager.create(&spec).await.unwrap();
        assert_eq!(record.state, ContainerState::Created);

        manager.start(&record.id).await.unwrap();
        assert_eq!(
            manager.store().get_container(&record.id).await.unwrap().state,
            ContainerState::Running
        );
        assert!(runtime.is_running(&record.id).await);

        manager.stop(&record.id, Some(5)).await.unwrap();
        assert_eq!(
            manager.store().get_container(&record.id).await.unwrap().state,
            ContainerState::Stopped
        );

        manager.remove(&record.id, false).await.unwrap();
        // record deleted last
        assert!(manager.store().get_container(&record.id).await.is_err());
    }

    #[tokio::test]
    async fn start_failure_lands_in_error() {
        let (manager, runtime, _dir) = test_manager().await;
        let record = manager.create(&sample_spec("org/repo1")).await.unwrap();

        runtime.fail_next_start().await;
        assert!(manager.start(&record.id).await.is_err());
        assert_eq!(
            manager.store().get_container(&record.id).await.unwrap().state,
            ContainerState::Error
        );

        // error containers can still be removed
        manager.remove(&record.id, false).await.unwrap();
    }

    #[tokio::test]
    async fn exec_forbidden_unless_running() {
        let (manager, _runtime, _dir) = test_manager().await;
        let record = manager.create(&sample_spec("org/repo1")).await.unwrap();

        let err = manager
            .exec(&record.id, &["true".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::ExecForbidden { .. }));

        manager.start(&record.id).await.unwrap();
        assert!(manager.exec(&record.id, &["true".to_string()]).await.is_ok());
    }

    #[tokio::test]
    async fn errored_workload_stops_before_removal() {
        let (manager, runtime, _dir) = test_manager().await;
        let record = manager.create(&sample_spec("org/repo1")).await.unwrap();
        manager.start(&record.id).await.unwrap();

        // a failing graceful stop leaves a once-RUNNING container in ERROR
        runtime.fail_stop_for(&record.id).await;
        assert!(manager.stop(&record.id, Some(5)).await.is_err());
        assert_eq!(
            manager.store().get_container(&record.id).await.unwrap().state,
            ContainerState::Error
        );

        // removal records the stop first, then removes
        let states = manager.bus.subscribe(&["container.state"], None);
        manager.remove(&record.id, true).await.unwrap();
        assert!(manager.store().get_container(&record.id).await.is_err());

        let mut seen = Vec::new();
        while let Some(event) = states.try_recv() {
            if let runnerhub_types::MonitorEvent::ContainerState { state, .. } = event {
                seen.push(state);
            }
        }
        let stopped = seen.iter().position(|s| *s == ContainerState::Stopped);
        let removed = seen.iter().position(|s| *s == ContainerState::Removed);
        assert!(stopped.is_some() && removed.is_some() && stopped < removed);
    }

    #[tokio::test]
    async fn remove_running_requires_force() {
        let (manager, _runtime, _dir) = test_manager().await;
        let record = manager.create(&sample_spec("org/repo1")).await.unwrap();
        manager.start(&record.id).await.unwrap();

        assert!(manager.remove(&record.id, false).await.is_err());
        manager.remove(&record.id, true).await.unwrap();
    }

    #[tokio::test]
    async fn stats_difference_successive_samples() {
        let (manager, runtime, _dir) = test_manager().await;
        let record = manager.create(&sample_spec("org/repo1")).await.unwrap();
        manager.start(&record.id).await.unwrap();

        runtime
            .set_stats(
                &record.id,
                RawStats {
                    cpu_total_ns: 1_000,
                    system_cpu_ns: 10_000,
                    online_cpus: 2,
                    mem_usage_bytes: 512,
                    mem_limit_bytes: 1024,
                    ..Default::default()
                },
            )
            .await;
        // first reading has no baseline; cpu_pct is zero
        let first = manager.stats(&record.id).await.unwrap();
        assert_eq!(first.cpu_pct, 0.0);
        assert_eq!(first.mem_pct, 50.0);

        runtime
            .set_stats(
                &record.id,
                RawStats {
                    cpu_total_ns: 2_000,
                    system_cpu_ns: 20_000,
                    online_cpus: 2,
                    mem_usage_bytes: 512,
                    mem_limit_bytes: 1024,
                    rx_bytes: 100,
                    ..Default::default()
                },
            )
            .await;
        let second = manager.stats(&record.id).await.unwrap();
        // (1000 / 10000) * 2 cpus * 100
        assert!((second.cpu_pct - 20.0).abs() < f64::EPSILON);
        assert_eq!(second.rx_bytes, 100);
    }

    #[tokio::test]
    async fn spec_labels_identify_workload() {
        let spec = sample_spec("org/repo1");
        let repo: Repository = Repository::new("org/repo1").unwrap();
        assert_eq!(spec.repository, repo);
        assert_eq!(
            spec.labels.get("runnerhub.repository").map(String::as_str),
            Some("org/repo1")
        );
    }
}
