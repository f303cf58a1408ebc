use chrono::Utc;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

use runnerhub_types::{
    Classify, ContainerSpec, ErrorCode, Job, MonitorEvent, PoolMetrics, PoolPolicy, Repository,
    ResourceLimits, Runner, RunnerId, RunnerName, RunnerPool, RunnerStatus, RunnerType,
};
use utils::lock::KeyedMutex;

use crate::storage::{Store, StoreError};
use crate::subsystems::lifecycle::{LifecycleError, LifecycleManager};
use crate::subsystems::monitor::MonitorBus;
use crate::subsystems::network::NetworkError;
use crate::subsystems::router::RouteOutcome;
use crate::subsystems::upstream::{UpstreamApi, UpstreamError};

const RUNNER_NAME_PREFIX: &str = "runnerhub";

#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("pool {repository} is at max_runners ({max})")]
    AtCapacity { repository: Repository, max: u32 },

    #[error("runner {0} did not become ready within the startup timeout")]
    StartupTimeout(RunnerName),
}

impl Classify for PoolError {
    fn code(&self) -> ErrorCode {
        match self {
            PoolError::Store(e) => e.code(),
            PoolError::Lifecycle(e) => e.code(),
            PoolError::Network(e) => e.code(),
            PoolError::Upstream(e) => e.code(),
            PoolError::AtCapacity { .. } => ErrorCode::Transient,
            PoolError::StartupTimeout(_) => ErrorCode::Transient,
        }
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

/// What the dispatcher gets back from an allocation attempt.
#[derive(Debug, Clone)]
pub enum Allocation {
    /// A free runner was claimed for the job
    Allocated(Runner),
    /// No free runner; the caller should request capacity and retry. When an
    /// exclusive rule matched, new runners must carry exactly these labels.
    Pending {
        required_labels: Option<BTreeSet<String>>,
    },
    /// The pool cannot ever satisfy the request
    Impossible(String),
}

#[derive(Debug, Clone)]
pub struct PoolManagerConfig {
    pub runner_image: String,
    pub default_policy: PoolPolicy,
    pub default_limits: ResourceLimits,
    pub default_runner_labels: BTreeSet<String>,
    /// Poll spacing while waiting for a fresh runner's container
    pub startup_poll_interval: Duration,
}

impl Default for PoolManagerConfig {
    fn default() -> Self {
        Self {
            runner_image: "ghcr.io/runnerhub/runner:latest".to_string(),
            default_policy: PoolPolicy::default(),
            default_limits: ResourceLimits::default(),
            default_runner_labels: ["self-hosted".to_string()].into(),
            startup_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Creates and destroys per-repository runners, enforcing each pool's
/// min/max. All scaling work for one repository is serialized on its key.
pub struct PoolManager {
    store: Store,
    lifecycle: Arc<LifecycleManager>,
    upstream: Arc<dyn UpstreamApi>,
    bus: Arc<MonitorBus>,
    config: PoolManagerConfig,
    locks: KeyedMutex<Repository>,
}

impl PoolManager {
    pub fn new(
        store: Store,
        lifecycle: Arc<LifecycleManager>,
        upstream: Arc<dyn UpstreamApi>,
        bus: Arc<MonitorBus>,
        config: PoolManagerConfig,
    ) -> Self {
        Self {
            store,
            lifecycle,
            upstream,
            bus,
            config,
            locks: KeyedMutex::new(),
        }
    }

    /// Load the pool row, creating it with the default policy on first
    /// contact with a repository.
    pub async fn ensure_pool(&self, repository: &Repository) -> PoolResult<RunnerPool> {
        if let Some(pool) = self.store.get_pool(repository).await? {
            return Ok(pool);
        }
        let now = Utc::now();
        let pool = RunnerPool {
            repository: repository.clone(),
            policy: self.config.default_policy.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_pool(&pool).await?;
        tracing::info!("Created pool for {}", repository);
        Ok(pool)
    }

    pub async fn update_policy(
        &self,
        repository: &Repository,
        policy: PoolPolicy,
    ) -> PoolResult<RunnerPool> {
        let _guard = self.locks.lock(repository.clone()).await;
        let mut pool = self.ensure_pool(repository).await?;
        pool.policy = policy;
        pool.updated_at = Utc::now();
        self.store.upsert_pool(&pool).await?;
        Ok(pool)
    }

    pub async fn metrics(&self, repository: &Repository) -> PoolResult<PoolMetrics> {
        let (total, idle, busy) = self.store.count_pool_runners(repository).await?;
        let (queue_depth, avg_wait_s) = self.store.queued_stats(repository).await?;
        Ok(PoolMetrics {
            total_runners: total,
            idle_runners: idle,
            busy_runners: busy,
            queue_depth,
            avg_wait_s,
        })
    }

    /// Try to satisfy a routed job with a free runner. "Free" means IDLE with
    /// a RUNNING container; the claim is atomic so two dispatchers cannot
    /// take the same runner.
    #[instrument(level = "debug", skip(self, job, outcome), fields(subsys = "Pool", job_id = %job.id))]
    pub async fn request_runner(&self, job: &Job, outcome: &RouteOutcome) -> PoolResult<Allocation> {
        let pool = self.ensure_pool(&job.repository).await?;

        if let Some(runner) = &outcome.selected {
            if self.container_running(runner).await? && self.store.claim_runner(runner.id).await? {
                let claimed = self.store.get_runner(runner.id).await?;
                return Ok(Allocation::Allocated(claimed));
            }
        }

        // nothing free: decide whether capacity can ever arrive
        if outcome.exclusive() {
            let required = outcome.required_labels().cloned();
            if !pool.policy.dynamic_labels {
                return Ok(Allocation::Impossible(format!(
                    "exclusive rule requires labels {:?} and pool {} forbids dynamic label targeting",
                    required, job.repository
                )));
            }
            // dynamic labels: the scale-up this triggers must synthesize the
            // rule's exact label set
            return Ok(Allocation::Pending {
                required_labels: required,
            });
        }

        let (total, _, _) = self.store.count_pool_runners(&job.repository).await?;
        if total >= pool.policy.max_runners {
            tracing::debug!(
                "Pool {} at capacity ({}/{})",
                job.repository,
                total,
                pool.policy.max_runners
            );
        }
        Ok(Allocation::Pending {
            required_labels: None,
        })
    }

    /// Release after job completion. EPHEMERAL runners are destroyed; others
    /// return to IDLE.
    #[instrument(level = "debug", skip(self), fields(subsys = "Pool"))]
    pub async fn release_runner(&self, runner_id: RunnerId) -> PoolResult<()> {
        let runner = self.store.get_runner(runner_id).await?;
        let Some(repository) = runner.repository.clone() else {
            self.store
                .update_runner_status(runner_id, RunnerStatus::Idle)
                .await?;
            return Ok(());
        };
        let _guard = self.locks.lock(repository.clone()).await;

        match runner.runner_type {
            RunnerType::Ephemeral => {
                // single-use: never returns to IDLE
                self.store
                    .update_runner_status(runner_id, RunnerStatus::Stopping)
                    .await?;
                self.destroy_runner(&runner).await?;
            }
            RunnerType::Proxy | RunnerType::Dedicated => {
                self.store
                    .update_runner_status(runner_id, RunnerStatus::Idle)
                    .await?;
                self.store.heartbeat_runner(runner_id, Utc::now()).await?;
            }
        }
        Ok(())
    }

    /// Add `count` ephemeral runners, bounded by max_runners. Returns how
    /// many were actually created.
    #[instrument(level = "debug", skip(self), fields(subsys = "Pool"))]
    pub async fn scale_up(
        &self,
        repository: &Repository,
        count: u32,
        labels: Option<BTreeSet<String>>,
    ) -> PoolResult<u32> {
        let _guard = self.locks.lock(repository.clone()).await;
        let pool = self.ensure_pool(repository).await?;

        let (total, _, _) = self.store.count_pool_runners(repository).await?;
        let headroom = pool.policy.max_runners.saturating_sub(total);
        let to_create = count.min(headroom);
        if to_create == 0 {
            return Err(PoolError::AtCapacity {
                repository: repository.clone(),
                max: pool.policy.max_runners,
            });
        }

        let mut created = 0;
        for _ in 0..to_create {
            match self
                .create_runner(repository, &pool.policy, labels.clone())
                .await
            {
                Ok(runner) => {
                    created += 1;
                    self.bus.publish(MonitorEvent::RunnerCreated {
                        runner_id: runner.id,
                        repository: repository.clone(),
                    });
                }
                Err(err) => {
                    tracing::error!("Runner creation failed for {}: {}", repository, err);
                    if created == 0 {
                        return Err(err);
                    }
                    break;
                }
            }
        }
        Ok(created)
    }

    /// Remove up to `count` idle runners, never going below min_runners.
    /// Longest-idle runners go first. Returns how many were destroyed.
    #[instrument(level = "debug", skip(self), fields(subsys = "Pool"))]
    pub async fn scale_down(&self, repository: &Repository, count: u32) -> PoolResult<u32> {
        let _guard = self.locks.lock(repository.clone()).await;
        let pool = self.ensure_pool(repository).await?;

        let (total, idle, _) = self.store.count_pool_runners(repository).await?;
        let removable = total
            .saturating_sub(pool.policy.min_runners)
            .min(idle)
            .min(count);
        if removable == 0 {
            return Ok(0);
        }

        let mut idle_runners = self
            .store
            .list_runners(Some(repository), Some(RunnerStatus::Idle), None)
            .await?;
        idle_runners.sort_by_key(|r| r.last_heartbeat.unwrap_or(r.created_at));

        let mut destroyed = 0;
        for runner in idle_runners.into_iter().take(removable as usize) {
            // skip runners a dispatcher claimed since the listing
            if !self.store.claim_runner(runner.id).await? {
                continue;
            }
            self.store
                .update_runner_status(runner.id, RunnerStatus::Stopping)
                .await?;
            match self.destroy_runner(&runner).await {
                Ok(()) => destroyed += 1,
                Err(err) => {
                    tracing::error!("Runner destroy failed for {}: {}", runner.name, err);
                }
            }
        }
        Ok(destroyed)
    }

    /// The full create pipeline: registration token, reserved name, container
    /// spec, network attach, start, then wait for the first heartbeat.
    async fn create_runner(
        &self,
        repository: &Repository,
        policy: &PoolPolicy,
        labels: Option<BTreeSet<String>>,
    ) -> PoolResult<Runner> {
        let token = self
            .upstream
            .issue_runner_registration_token(repository)
            .await?;

        let nonce: String = {
            let mut rng = rand::rng();
            (0..6)
                .map(|_| {
                    let n: u8 = rng.random_range(0..36);
                    char::from_digit(n as u32, 36).unwrap()
                })
                .collect()
        };
        let name = RunnerName::new(format!(
            "{}-{}-{}-{}",
            RUNNER_NAME_PREFIX,
            RunnerType::Ephemeral.as_str(),
            repository.normalized(),
            nonce
        ))
        .unwrap_or_else(|_| {
            RunnerName::new(format!(
                "{}-{}-{}",
                RUNNER_NAME_PREFIX,
                RunnerType::Ephemeral.as_str(),
                nonce
            ))
            .expect("prefix plus nonce is always a valid runner name")
        });

        let runner_labels = labels.unwrap_or_else(|| self.config.default_runner_labels.clone());
        let runner_id = RunnerId::generate();

        let env: BTreeMap<String, String> = [
            ("RUNNER_REPOSITORY".to_string(), repository.to_string()),
            ("RUNNER_NAME".to_string(), name.to_string()),
            ("RUNNER_TOKEN".to_string(), token.token.clone()),
            (
                "RUNNER_LABELS".to_string(),
                runner_labels.iter().cloned().collect::<Vec<_>>().join(","),
            ),
            ("RUNNER_EPHEMERAL".to_string(), "true".to_string()),
        ]
        .into();
        let container_labels: BTreeMap<String, String> = [
            ("runnerhub.managed".to_string(), "true".to_string()),
            ("runnerhub.repository".to_string(), repository.to_string()),
            ("runnerhub.runner".to_string(), runner_id.to_string()),
        ]
        .into();

        let spec = ContainerSpec {
            name: name.to_string(),
            image: self.config.runner_image.clone(),
            env,
            labels: container_labels,
            resources: self.config.default_limits,
            read_only_root: false,
            repository: repository.clone(),
            job_id: None,
            runner_id: Some(runner_id),
        };

        let record = self.lifecycle.create(&spec).await?;
        let runner = Runner {
            id: runner_id,
            name: name.clone(),
            runner_type: RunnerType::Ephemeral,
            repository: Some(repository.clone()),
            labels: runner_labels,
            status: RunnerStatus::Starting,
            container_id: Some(record.id.clone()),
            upstream_runner_id: None,
            jobs_served: 0,
            last_heartbeat: None,
            created_at: Utc::now(),
        };
        self.store.insert_runner(&runner).await?;

        if let Err(err) = self.start_and_await_ready(&runner, policy).await {
            tracing::error!("Runner {} failed to start: {}", name, err);
            self.store
                .update_runner_status(runner.id, RunnerStatus::Offline)
                .await?;
            if let Err(cleanup_err) = self.lifecycle.remove(&record.id, true).await {
                tracing::warn!(
                    "Cleanup after failed start also failed for {}: {}",
                    name,
                    cleanup_err
                );
            }
            return Err(err);
        }

        let ready = self.store.get_runner(runner.id).await?;
        tracing::info!(
            "Runner ready: name={}, repo={}, labels={:?}",
            ready.name,
            repository,
            ready.labels
        );
        Ok(ready)
    }

    async fn start_and_await_ready(&self, runner: &Runner, policy: &PoolPolicy) -> PoolResult<()> {
        let container_id = runner
            .container_id
            .clone()
            .expect("fresh runners always have a container");

        self.lifecycle
            .network()
            .attach(&container_id, runner.repository.as_ref().unwrap())
            .await?;
        self.lifecycle.start(&container_id).await?;

        // the first successful RUNNING observation is the runner's heartbeat
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(policy.startup_timeout_s);
        loop {
            if let Ok(record) = self.lifecycle.store().get_container(&container_id).await {
                if record.state == runnerhub_types::ContainerState::Running {
                    let now = Utc::now();
                    self.store.heartbeat_runner(runner.id, now).await?;
                    self.store
                        .update_runner_status(runner.id, RunnerStatus::Idle)
                        .await?;
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PoolError::StartupTimeout(runner.name.clone()));
            }
            tokio::time::sleep(self.config.startup_poll_interval).await;
        }
    }

    /// Deregister upstream (idempotent), stop and remove the container, mark
    /// the runner OFFLINE.
    async fn destroy_runner(&self, runner: &Runner) -> PoolResult<()> {
        if let (Some(repository), Some(upstream_id)) =
            (&runner.repository, runner.upstream_runner_id)
        {
            self.upstream.remove_runner(repository, upstream_id).await?;
        }

        if let Some(container_id) = &runner.container_id {
            match self.lifecycle.remove(container_id, true).await {
                Ok(()) => {}
                Err(LifecycleError::Store(StoreError::NotFound(_))) => {}
                Err(err) => return Err(err.into()),
            }
        }

        self.store
            .update_runner_status(runner.id, RunnerStatus::Offline)
            .await?;
        if let Some(repository) = &runner.repository {
            self.bus.publish(MonitorEvent::RunnerDestroyed {
                runner_id: runner.id,
                repository: repository.clone(),
            });
        }
        tracing::info!("Runner destroyed: {}", runner.name);
        Ok(())
    }

    async fn container_running(&self, runner: &Runner) -> PoolResult<bool> {
        let Some(container_id) = &runner.container_id else {
            return Ok(false);
        };
        match self.store.get_container(container_id).await {
            Ok(record) => Ok(record.state == runnerhub_types::ContainerState::Running),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::app::TestApp;
    use crate::test_utils::fixtures::queued_job;

    #[tokio::test]
    async fn scale_up_creates_ready_runner() {
        let app = TestApp::new().await;
        let repo = Repository::new("org/repo1").unwrap();

        let created = app.pool.scale_up(&repo, 1, None).await.unwrap();
        assert_eq!(created, 1);

        let runners = app
            .store
            .list_runners(Some(&repo), Some(RunnerStatus::Idle), None)
            .await
            .unwrap();
        assert_eq!(runners.len(), 1);
        let runner = &runners[0];
        assert_eq!(runner.runner_type, RunnerType::Ephemeral);
        assert!(runner.name.as_ref().starts_with("runnerhub-ephemeral-"));
        assert!(runner.last_heartbeat.is_some());

        // container is attached only to the repo's isolation network
        let container_id = runner.container_id.clone().unwrap();
        assert!(app.network.verify(&container_id).await.unwrap());
    }

    #[tokio::test]
    async fn scale_up_respects_max_runners() {
        let app = TestApp::with_policy(PoolPolicy {
            max_runners: 2,
            ..PoolPolicy::default()
        })
        .await;
        let repo = Repository::new("org/repo1").unwrap();

        assert_eq!(app.pool.scale_up(&repo, 5, None).await.unwrap(), 2);
        assert!(matches!(
            app.pool.scale_up(&repo, 1, None).await.unwrap_err(),
            PoolError::AtCapacity { .. }
        ));
    }

    #[tokio::test]
    async fn ephemeral_release_destroys_runner() {
        let app = TestApp::new().await;
        let repo = Repository::new("org/repo1").unwrap();
        app.pool.scale_up(&repo, 1, None).await.unwrap();

        let runner = app
            .store
            .list_runners(Some(&repo), Some(RunnerStatus::Idle), None)
            .await
            .unwrap()
            .remove(0);
        assert!(app.store.claim_runner(runner.id).await.unwrap());

        app.pool.release_runner(runner.id).await.unwrap();

        let after = app.store.get_runner(runner.id).await.unwrap();
        assert_eq!(after.status, RunnerStatus::Offline);
        // the container is gone with it
        assert!(app
            .store
            .get_container(runner.container_id.as_ref().unwrap())
            .await
            .is_err());
        // pool size decreased by exactly one
        let (total, _, _) = app.store.count_pool_runners(&repo).await.unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn scale_down_keeps_min_runners() {
        let app = TestApp::with_policy(PoolPolicy {
            min_runners: 1,
            max_runners: 5,
            ..PoolPolicy::default()
        })
        .await;
        let repo = Repository::new("org/repo1").unwrap();
        app.pool.scale_up(&repo, 3, None).await.unwrap();

        let destroyed = app.pool.scale_down(&repo, 10).await.unwrap();
        assert_eq!(destroyed, 2);
        let (total, _, _) = app.store.count_pool_runners(&repo).await.unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn request_runner_pending_when_pool_empty() {
        let app = TestApp::new().await;
        let job = queued_job("org/repo1", &["self-hosted"]);
        app.store.insert_job(&job).await.unwrap();

        let outcome = app.router.route(&job, None, "workflow_job").await.unwrap();
        let allocation = app.pool.request_runner(&job, &outcome).await.unwrap();
        assert!(matches!(
            allocation,
            Allocation::Pending {
                required_labels: None
            }
        ));
    }

    #[tokio::test]
    async fn pending_exclusive_allocation_carries_rule_labels() {
        let app = TestApp::new().await;
        app.store
            .insert_rule(&crate::test_utils::fixtures::rule(
                "gpu",
                100,
                &["gpu"],
                &["gpu", "cuda-12"],
                true,
            ))
            .await
            .unwrap();

        let job = queued_job("org/repo1", &["gpu"]);
        app.store.insert_job(&job).await.unwrap();
        let outcome = app.router.route(&job, None, "workflow_job").await.unwrap();
        let allocation = app.pool.request_runner(&job, &outcome).await.unwrap();

        let Allocation::Pending { required_labels } = allocation else {
            panic!("expected pending allocation");
        };
        let expected: BTreeSet<String> = ["gpu".to_string(), "cuda-12".to_string()].into();
        assert_eq!(required_labels, Some(expected));
    }

    #[tokio::test]
    async fn request_runner_claims_selected_idle_runner() {
        let app = TestApp::new().await;
        let repo = Repository::new("org/repo1").unwrap();
        app.pool.scale_up(&repo, 1, None).await.unwrap();

        let job = queued_job("org/repo1", &["self-hosted"]);
        app.store.insert_job(&job).await.unwrap();

        let outcome = app.router.route(&job, None, "workflow_job").await.unwrap();
        let allocation = app.pool.request_runner(&job, &outcome).await.unwrap();
        let Allocation::Allocated(runner) = allocation else {
            panic!("expected allocation");
        };
        assert_eq!(runner.status, RunnerStatus::Busy);
        assert_eq!(runner.jobs_served, 1);
    }

    #[tokio::test]
    async fn exclusive_without_dynamic_labels_is_impossible() {
        let app = TestApp::with_policy(PoolPolicy {
            dynamic_labels: false,
            ..PoolPolicy::default()
        })
        .await;
        let repo = Repository::new("org/repo1").unwrap();
        app.pool.ensure_pool(&repo).await.unwrap();

        app.store
            .insert_rule(&crate::test_utils::fixtures::rule(
                "gpu",
                100,
                &["gpu"],
                &["gpu", "cuda-12"],
                true,
            ))
            .await
            .unwrap();

        let job = queued_job("org/repo1", &["gpu"]);
        app.store.insert_job(&job).await.unwrap();
        let outcome = app.router.route(&job, None, "workflow_job").await.unwrap();
        let allocation = app.pool.request_runner(&job, &outcome).await.unwrap();
        assert!(matches!(allocation, Allocation::Impossible(_)));
    }

    #[tokio::test]
    async fn startup_failure_cleans_up() {
        let app = TestApp::new().await;
        let repo = Repository::new("org/repo1").unwrap();
        app.runtime.fail_next_start().await;

        assert!(app.pool.scale_up(&repo, 1, None).await.is_err());
        let (total, _, _) = app.store.count_pool_runners(&repo).await.unwrap();
        assert_eq!(total, 0);
        // no containers left behind
        assert!(app
            .store
            .list_containers(None, None)
            .await
            .unwrap()
            .is_empty());
    }
}
