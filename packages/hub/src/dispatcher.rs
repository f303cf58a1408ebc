use chrono::{Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

use runnerhub_types::{
    Classify, DispatchPayload, ErrorCode, Job, JobId, JobStatus, MonitorEvent, Snapshot,
    JobCounts, PoolSnapshot, RunnerCounts, WorkflowJobAction,
};
use utils::context::AppContext;
use utils::lock::KeyedMutex;
use utils::telemetry::HubMetrics;

use crate::storage::{Queue, QueueError, QueueMessage, Store, StoreError};
use crate::subsystems::ingress::Ingress;
use crate::subsystems::lifecycle::LifecycleManager;
use crate::subsystems::monitor::MonitorBus;
use crate::subsystems::network::NetworkIsolator;
use crate::subsystems::pool::{Allocation, PoolError, PoolManager};
use crate::subsystems::router::{JobRouter, RouterError};
use crate::subsystems::scaler::AutoScaler;
use crate::subsystems::upstream::UpstreamApi;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("malformed dispatch message: {0}")]
    MalformedMessage(String),
}

impl Classify for DispatchError {
    fn code(&self) -> ErrorCode {
        match self {
            DispatchError::Store(e) => e.code(),
            DispatchError::Queue(e) => e.code(),
            DispatchError::Router(e) => e.code(),
            DispatchError::Pool(e) => e.code(),
            DispatchError::MalformedMessage(_) => ErrorCode::Validation,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub visibility_timeout_s: u64,
    /// Idle sleep between reserve attempts when the queue is empty
    pub poll_interval_ms: u64,
    pub snapshot_interval_s: u64,
    pub cleanup_interval_s: u64,
    pub reaper_interval_s: u64,
    pub schedule_tick_s: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            visibility_timeout_s: 60,
            poll_interval_ms: 500,
            snapshot_interval_s: 10,
            cleanup_interval_s: 300,
            reaper_interval_s: 300,
            schedule_tick_s: 30,
        }
    }
}

/// The orchestration hub: owns the subsystems and runs the dispatch workers
/// plus the autonomous loops (scaler, cleanup, reaper, sampler, snapshot).
pub struct Dispatcher {
    pub store: Store,
    pub queue: Queue,
    pub ingress: Arc<Ingress>,
    pub router: Arc<JobRouter>,
    pub pool: Arc<PoolManager>,
    pub scaler: Arc<AutoScaler>,
    pub lifecycle: Arc<LifecycleManager>,
    pub network: Arc<NetworkIsolator>,
    pub upstream: Arc<dyn UpstreamApi>,
    pub bus: Arc<MonitorBus>,
    pub metrics: HubMetrics,
    config: DispatcherConfig,
    job_locks: KeyedMutex<JobId>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        queue: Queue,
        ingress: Arc<Ingress>,
        router: Arc<JobRouter>,
        pool: Arc<PoolManager>,
        scaler: Arc<AutoScaler>,
        lifecycle: Arc<LifecycleManager>,
        network: Arc<NetworkIsolator>,
        upstream: Arc<dyn UpstreamApi>,
        bus: Arc<MonitorBus>,
        metrics: HubMetrics,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            queue,
            ingress,
            router,
            pool,
            scaler,
            lifecycle,
            network,
            upstream,
            bus,
            metrics,
            config,
            job_locks: KeyedMutex::new(),
        }
    }

    /// Spawn the worker pool and every autonomous loop. Returns immediately;
    /// tasks run until the context is killed.
    pub fn start(self: &Arc<Self>, ctx: AppContext) {
        for worker in 0..self.config.workers {
            let dispatcher = self.clone();
            let worker_id = format!("dispatcher-{worker}");
            let mut kill = ctx.get_kill_receiver();
            ctx.rt.spawn(async move {
                tracing::debug!("Worker {} starting", worker_id);
                loop {
                    tokio::select! {
                        _ = kill.recv() => {
                            tracing::debug!("Worker {} draining", worker_id);
                            return;
                        }
                        _ = dispatcher.work_once(&worker_id) => {}
                    }
                }
            });
        }

        self.spawn_scaler_loop(&ctx);
        self.spawn_interval_loop(&ctx, "cleanup", self.config.cleanup_interval_s, {
            let dispatcher = self.clone();
            move || {
                let dispatcher = dispatcher.clone();
                async move {
                    match dispatcher.lifecycle.run_cleanup().await {
                        Ok(history) if history.removed > 0 || history.failed > 0 => {
                            tracing::info!(
                                "Cleanup run: evaluated={}, removed={}, failed={}",
                                history.evaluated,
                                history.removed,
                                history.failed
                            );
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!("Cleanup run failed: {}", err),
                    }
                }
            }
        });
        self.spawn_interval_loop(&ctx, "network-reaper", self.config.reaper_interval_s, {
            let dispatcher = self.clone();
            move || {
                let dispatcher = dispatcher.clone();
                async move {
                    match dispatcher.network.reap().await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!("Network reaper removed {} networks", n),
                        Err(err) => tracing::warn!("Network reaper failed: {}", err),
                    }
                }
            }
        });
        let sampler_interval = self.lifecycle.sampler_config().interval_s;
        self.spawn_interval_loop(&ctx, "sampler", sampler_interval, {
            let dispatcher = self.clone();
            move || {
                let dispatcher = dispatcher.clone();
                async move {
                    dispatcher.lifecycle.run_sampler().await;
                    dispatcher.lifecycle.run_health_check().await;
                }
            }
        });
        self.spawn_interval_loop(&ctx, "snapshot", self.config.snapshot_interval_s, {
            let dispatcher = self.clone();
            move || {
                let dispatcher = dispatcher.clone();
                async move {
                    match dispatcher.build_snapshot().await {
                        Ok(snapshot) => dispatcher.bus.push_snapshot(snapshot),
                        Err(err) => tracing::debug!("Snapshot skipped: {}", err),
                    }
                }
            }
        });
        self.spawn_interval_loop(&ctx, "schedules", self.config.schedule_tick_s, {
            let dispatcher = self.clone();
            move || {
                let dispatcher = dispatcher.clone();
                async move {
                    if let Err(err) = dispatcher.queue.tick_schedules(Utc::now()).await {
                        tracing::warn!("Schedule tick failed: {}", err);
                    }
                }
            }
        });

        tracing::info!(
            "Dispatcher started: workers={}, visibility_timeout={}s",
            self.config.workers,
            self.config.visibility_timeout_s
        );
    }

    fn spawn_interval_loop<F, Fut>(&self, ctx: &AppContext, name: &'static str, secs: u64, tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let mut kill = ctx.get_kill_receiver();
        ctx.rt.spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = kill.recv() => {
                        tracing::debug!("Loop {} shutting down", name);
                        return;
                    }
                    _ = interval.tick() => tick().await,
                }
            }
        });
    }

    fn spawn_scaler_loop(self: &Arc<Self>, ctx: &AppContext) {
        let dispatcher = self.clone();
        let mut kill = ctx.get_kill_receiver();
        ctx.rt.spawn(async move {
            let tick_s = dispatcher.scaler.config().tick_s.max(1);
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(tick_s));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = kill.recv() => {
                        tracing::debug!("Scaler loop shutting down");
                        return;
                    }
                    _ = interval.tick() => {
                        if let Err(err) = dispatcher.scaler.tick().await {
                            tracing::warn!("Scaler tick failed: {}", err);
                        }
                    }
                    nudged = dispatcher.scaler.next_nudge() => {
                        if let Some(repository) = nudged {
                            if let Err(err) = dispatcher.scaler.evaluate_pool(&repository).await {
                                tracing::warn!("Nudged evaluation failed for {}: {}", repository, err);
                            }
                        }
                    }
                }
            }
        });
    }

    /// One reserve-process cycle; sleeps briefly when the queue is empty.
    pub async fn work_once(&self, worker_id: &str) {
        let message = match self
            .queue
            .reserve(
                worker_id,
                Duration::seconds(self.config.visibility_timeout_s as i64),
            )
            .await
        {
            Ok(Some(message)) => message,
            Ok(None) => {
                tokio::time::sleep(std::time::Duration::from_millis(
                    self.config.poll_interval_ms,
                ))
                .await;
                return;
            }
            Err(err) => {
                tracing::warn!("Reserve failed: {}", err);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                return;
            }
        };

        self.metrics.dispatcher.in_flight.add(1, &[]);
        if let Err(err) = self.process_message(&message).await {
            tracing::error!("Message {} processing failed: {}", message.id, err);
        }
        self.metrics.dispatcher.in_flight.add(-1, &[]);
    }

    #[instrument(level = "debug", skip(self, message), fields(subsys = "Dispatcher", message_id = message.id))]
    async fn process_message(&self, message: &QueueMessage) -> Result<(), DispatchError> {
        let payload: DispatchPayload = match serde_json::from_str(&message.payload) {
            Ok(payload) => payload,
            Err(err) => {
                self.queue
                    .dlq(message.id, Some(&format!("malformed payload: {err}")))
                    .await?;
                return Err(DispatchError::MalformedMessage(err.to_string()));
            }
        };

        let result = match payload.action {
            WorkflowJobAction::Queued => self.handle_queued(message, &payload).await,
            WorkflowJobAction::InProgress => self.handle_in_progress(&payload).await.map(|_| true),
            WorkflowJobAction::Completed => self.handle_completed(&payload).await.map(|_| true),
            WorkflowJobAction::Waiting => Ok(true),
        };

        match result {
            Ok(true) => {
                self.queue.ack(message.id).await?;
                self.store
                    .mark_webhook_processed(&payload.delivery_id, None)
                    .await?;
                Ok(())
            }
            // handled, but intentionally left reserved->nacked by the handler
            Ok(false) => Ok(()),
            Err(err) => {
                let code = err.code();
                if code.is_retryable() && message.attempts < message.max_attempts {
                    self.metrics.dispatcher.retried.add(1, &[]);
                    self.queue.nack(message.id, Some(&err.to_string())).await?;
                } else {
                    self.fail_job_for_payload(&payload, &err.to_string()).await;
                    self.queue.dlq(message.id, Some(&err.to_string())).await?;
                    self.store
                        .mark_webhook_processed(&payload.delivery_id, Some(&err.to_string()))
                        .await?;
                }
                Err(err)
            }
        }
    }

    /// Returns Ok(true) to ack, Ok(false) when the message was nacked for a
    /// scale-up retry.
    async fn handle_queued(
        &self,
        message: &QueueMessage,
        payload: &DispatchPayload,
    ) -> Result<bool, DispatchError> {
        let job = self.load_or_create_job(payload).await?;
        let _guard = self.job_locks.lock(job.id).await;

        // cancellation may have landed between enqueue and dispatch
        let job = self.store.get_job(job.id).await?;
        if job.status.is_terminal() {
            tracing::info!("Skipping dispatch of terminal job {}", job.id);
            return Ok(true);
        }
        if job.status != JobStatus::Queued {
            // already assigned by an earlier delivery attempt
            return Ok(true);
        }

        let outcome = self
            .router
            .route(&job, payload.facts.branch.as_deref(), &payload.event)
            .await?;

        match self.pool.request_runner(&job, &outcome).await? {
            Allocation::Allocated(runner) => {
                let assigned = self
                    .store
                    .assign_job(job.id, runner.id, runner.container_id.as_ref())
                    .await?;
                self.metrics.dispatcher.dispatched.add(1, &[]);
                self.bus.publish(MonitorEvent::JobAssigned {
                    job_id: assigned.id,
                    runner_id: runner.id,
                });
                tracing::info!(
                    "Job assigned: job={}, runner={}, repo={}",
                    assigned.id,
                    runner.name,
                    assigned.repository
                );
                Ok(true)
            }
            Allocation::Pending { required_labels } => {
                self.scaler.nudge(job.repository.clone(), required_labels);
                if message.attempts >= message.max_attempts {
                    let reason = "no runner became available within the retry budget";
                    self.metrics.dispatcher.failed.add(1, &[]);
                    self.store
                        .transition_job(job.id, JobStatus::Failed, Some(reason))
                        .await?;
                    self.bus.publish(MonitorEvent::JobFinished {
                        job_id: job.id,
                        status: JobStatus::Failed,
                    });
                    self.queue.dlq(message.id, Some(reason)).await?;
                    self.store
                        .mark_webhook_processed(&payload.delivery_id, Some(reason))
                        .await?;
                } else {
                    self.metrics.dispatcher.retried.add(1, &[]);
                    self.queue
                        .nack(message.id, Some("waiting for capacity"))
                        .await?;
                }
                Ok(false)
            }
            Allocation::Impossible(reason) => {
                tracing::error!("Unrecoverable routing for job {}: {}", job.id, reason);
                self.metrics.dispatcher.failed.add(1, &[]);
                self.store
                    .transition_job(job.id, JobStatus::Failed, Some(&reason))
                    .await?;
                self.bus.publish(MonitorEvent::JobFinished {
                    job_id: job.id,
                    status: JobStatus::Failed,
                });
                self.queue.dlq(message.id, Some(&reason)).await?;
                self.store
                    .mark_webhook_processed(&payload.delivery_id, Some(&reason))
                    .await?;
                Ok(false)
            }
        }
    }

    /// The upstream `in_progress` signal is authoritative for RUNNING.
    async fn handle_in_progress(&self, payload: &DispatchPayload) -> Result<(), DispatchError> {
        let job = self.load_or_create_job(payload).await?;
        let _guard = self.job_locks.lock(job.id).await;

        match self
            .store
            .transition_job(job.id, JobStatus::Running, None)
            .await
        {
            Ok(_) => Ok(()),
            // a cancelled or already-finished job stays put
            Err(StoreError::IllegalTransition(reason)) => {
                tracing::debug!("Ignoring in_progress for {}: {}", job.id, reason);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn handle_completed(&self, payload: &DispatchPayload) -> Result<(), DispatchError> {
        let Some(job) = self
            .store
            .find_job_by_upstream(&payload.repository, payload.facts.upstream_job_id)
            .await?
        else {
            tracing::debug!(
                "Completion for unknown job {} in {}",
                payload.facts.upstream_job_id,
                payload.repository
            );
            return Ok(());
        };
        let _guard = self.job_locks.lock(job.id).await;

        let (status, error) = match payload.facts.conclusion.as_deref() {
            Some("success") => (JobStatus::Completed, None),
            Some(conclusion) => (JobStatus::Failed, Some(conclusion.to_string())),
            None => (JobStatus::Completed, None),
        };

        match self
            .store
            .transition_job(job.id, status, error.as_deref())
            .await
        {
            Ok(_) => {}
            Err(StoreError::IllegalTransition(reason)) => {
                tracing::debug!("Ignoring completion for {}: {}", job.id, reason);
            }
            Err(err) => return Err(err.into()),
        }

        if let Some(runner_id) = job.assigned_runner_id {
            if let Err(err) = self.pool.release_runner(runner_id).await {
                tracing::error!("Release of runner {} failed: {}", runner_id, err);
            }
        }

        self.bus.publish(MonitorEvent::JobFinished {
            job_id: job.id,
            status,
        });
        tracing::info!("Job finished: job={}, status={}", job.id, status.as_str());
        Ok(())
    }

    async fn load_or_create_job(&self, payload: &DispatchPayload) -> Result<Job, DispatchError> {
        if let Some(job) = self
            .store
            .find_job_by_upstream(&payload.repository, payload.facts.upstream_job_id)
            .await?
        {
            return Ok(job);
        }

        let job = Job {
            id: JobId::generate(),
            upstream_job_id: payload.facts.upstream_job_id,
            upstream_run_id: payload.facts.upstream_run_id,
            repository: payload.repository.clone(),
            workflow: payload.facts.workflow.clone(),
            labels: payload.facts.labels.clone(),
            priority: payload.priority(),
            status: JobStatus::Queued,
            assigned_runner_id: None,
            container_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        };
        match self.store.insert_job(&job).await {
            Ok(()) => {
                self.bus.publish(MonitorEvent::JobQueued {
                    job_id: job.id,
                    repository: job.repository.clone(),
                });
                Ok(job)
            }
            // raced with another worker on the same upstream job
            Err(StoreError::Conflict(_)) => Ok(self
                .store
                .find_job_by_upstream(&payload.repository, payload.facts.upstream_job_id)
                .await?
                .expect("job exists after conflict")),
            Err(err) => Err(err.into()),
        }
    }

    async fn fail_job_for_payload(&self, payload: &DispatchPayload, reason: &str) {
        let Ok(Some(job)) = self
            .store
            .find_job_by_upstream(&payload.repository, payload.facts.upstream_job_id)
            .await
        else {
            return;
        };
        if job.status.is_terminal() {
            return;
        }
        self.metrics.dispatcher.failed.add(1, &[]);
        if let Err(err) = self
            .store
            .transition_job(job.id, JobStatus::Failed, Some(reason))
            .await
        {
            tracing::warn!("Could not fail job {}: {}", job.id, err);
        }
    }

    /// Explicit cancellation from the API. The dispatcher checks job status
    /// before assignment, so a cancelled job is never handed a runner.
    pub async fn cancel_job(&self, job_id: JobId, grace_s: u64) -> Result<Job, DispatchError> {
        let _guard = self.job_locks.lock(job_id).await;
        let job = self
            .store
            .transition_job(job_id, JobStatus::Cancelled, Some("cancelled by operator"))
            .await?;

        if let Some(container_id) = &job.container_id {
            if let Err(err) = self.lifecycle.stop(container_id, Some(grace_s)).await {
                tracing::warn!(
                    "Stop of container {} for cancelled job {} failed: {}",
                    container_id,
                    job_id,
                    err
                );
            }
        }
        if let Some(runner_id) = job.assigned_runner_id {
            if let Err(err) = self.pool.release_runner(runner_id).await {
                tracing::warn!("Release after cancel failed for {}: {}", runner_id, err);
            }
        }

        self.bus.publish(MonitorEvent::JobFinished {
            job_id,
            status: JobStatus::Cancelled,
        });
        Ok(job)
    }

    /// Assemble the monitoring snapshot from the store and live subsystems.
    pub async fn build_snapshot(&self) -> Result<Snapshot, DispatchError> {
        let (queued, running, completed, failed) = self.store.job_counts().await?;
        let (total, idle, busy, offline) = self.store.runner_counts().await?;

        let mut pools = Vec::new();
        for pool in self.store.list_pools().await? {
            let metrics = self.pool.metrics(&pool.repository).await?;
            pools.push(PoolSnapshot {
                repository: pool.repository.clone(),
                utilization: metrics.utilization(),
                size: metrics.total_runners,
                in_cooldown: self
                    .scaler
                    .in_cooldown(&pool.repository, pool.policy.cooldown_s),
            });
        }

        Ok(Snapshot {
            timestamp: Utc::now(),
            jobs: JobCounts {
                queued,
                running,
                completed,
                failed,
            },
            runners: RunnerCounts {
                total,
                idle,
                busy,
                offline,
            },
            pools,
            upstream: self.upstream.rate_limit(),
        })
    }
}
