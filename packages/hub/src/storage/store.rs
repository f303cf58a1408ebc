use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use thiserror::Error;
use tracing::instrument;

use runnerhub_types::{
    CleanupHistory, Classify, ContainerId, ContainerRecord, ContainerState, ErrorCode, Job, JobId,
    JobPriority, JobStatus, Network, PoolPolicy, Repository, ResourceLimits, ResourceSample,
    RoutingDecision, RoutingRule, RuleId, Runner, RunnerId, RunnerName, RunnerPool, RunnerStatus,
    RunnerType, ScaleDirection, ScalingEvent, ScalingTrigger, WebhookEvent,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl Classify for StoreError {
    fn code(&self) -> ErrorCode {
        match self {
            StoreError::Unavailable(_) => ErrorCode::Unavailable,
            StoreError::Conflict(_) => ErrorCode::Conflict,
            StoreError::NotFound(_) => ErrorCode::NotFound,
            StoreError::IllegalTransition(_) => ErrorCode::StateError,
            StoreError::Corrupt(_) => ErrorCode::Unavailable,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Filters for the jobs listing API.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub repository: Option<Repository>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

/// The single source of truth. One transaction per public operation; plain
/// single-statement operations rely on the implicit statement transaction.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ---- jobs ----

    #[instrument(level = "debug", skip(self, job), fields(subsys = "Store", job_id = %job.id))]
    pub async fn insert_job(&self, job: &Job) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO job (id, upstream_job_id, upstream_run_id, repository, workflow, labels, \
             priority, status, assigned_runner_id, container_id, created_at, started_at, \
             completed_at, error) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(job.upstream_job_id)
        .bind(job.upstream_run_id)
        .bind(job.repository.as_ref())
        .bind(&job.workflow)
        .bind(serde_json::to_string(&job.labels)?)
        .bind(job.priority.band())
        .bind(job.status.as_str())
        .bind(job.assigned_runner_id.map(|id| id.to_string()))
        .bind(job.container_id.as_ref().map(|id| id.to_string()))
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, id: JobId) -> StoreResult<Job> {
        let row = sqlx::query("SELECT * FROM job WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        job_from_row(&row)
    }

    pub async fn find_job_by_upstream(
        &self,
        repository: &Repository,
        upstream_job_id: i64,
    ) -> StoreResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM job WHERE repository = ? AND upstream_job_id = ?")
            .bind(repository.as_ref())
            .bind(upstream_job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Advance a job's status, enforcing the monotone lifecycle. The check
    /// and the write happen in one transaction.
    #[instrument(level = "debug", skip(self), fields(subsys = "Store"))]
    pub async fn transition_job(
        &self,
        id: JobId,
        next: JobStatus,
        error: Option<&str>,
    ) -> StoreResult<Job> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM job WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        let mut job = job_from_row(&row)?;

        if job.status == next {
            tx.commit().await?;
            return Ok(job);
        }
        if !job.status.can_transition_to(next) {
            return Err(StoreError::IllegalTransition(format!(
                "job {} cannot go {} -> {}",
                id,
                job.status.as_str(),
                next.as_str()
            )));
        }

        let now = Utc::now();
        let started_at = match next {
            JobStatus::Running if job.started_at.is_none() => Some(now),
            _ => job.started_at,
        };
        let completed_at = if next.is_terminal() { Some(now) } else { None };

        sqlx::query(
            "UPDATE job SET status = ?, started_at = ?, completed_at = ?, error = COALESCE(?, error) \
             WHERE id = ?",
        )
        .bind(next.as_str())
        .bind(started_at)
        .bind(completed_at)
        .bind(error)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        job.status = next;
        job.started_at = started_at;
        job.completed_at = completed_at;
        if let Some(error) = error {
            job.error = Some(error.to_string());
        }
        Ok(job)
    }

    /// ASSIGNED with the selected runner/container, in one transaction.
    pub async fn assign_job(
        &self,
        id: JobId,
        runner_id: RunnerId,
        container_id: Option<&ContainerId>,
    ) -> StoreResult<Job> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM job WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        let mut job = job_from_row(&row)?;

        if !job.status.can_transition_to(JobStatus::Assigned) {
            return Err(StoreError::IllegalTransition(format!(
                "job {} cannot go {} -> assigned",
                id,
                job.status.as_str()
            )));
        }

        sqlx::query(
            "UPDATE job SET status = 'assigned', assigned_runner_id = ?, container_id = ? WHERE id = ?",
        )
        .bind(runner_id.to_string())
        .bind(container_id.map(|c| c.to_string()))
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        job.status = JobStatus::Assigned;
        job.assigned_runner_id = Some(runner_id);
        job.container_id = container_id.cloned();
        Ok(job)
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> =
            sqlx::QueryBuilder::new("SELECT * FROM job WHERE 1=1");
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(repo) = &filter.repository {
            qb.push(" AND repository = ").push_bind(repo.to_string());
        }
        if let Some(since) = filter.since {
            qb.push(" AND created_at >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            qb.push(" AND created_at <= ").push_bind(until);
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(if filter.limit > 0 { filter.limit } else { 100 })
            .push(" OFFSET ")
            .push_bind(filter.offset.max(0));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    /// `(queue depth, mean wait seconds)` over currently-QUEUED jobs.
    pub async fn queued_stats(&self, repository: &Repository) -> StoreResult<(u32, f64)> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS depth, created_at FROM job WHERE repository = ? AND status = 'queued'",
        )
        .bind(repository.as_ref())
        .fetch_one(&self.pool)
        .await?;
        let depth: i64 = row.try_get("depth")?;
        if depth == 0 {
            return Ok((0, 0.0));
        }

        let rows = sqlx::query(
            "SELECT created_at FROM job WHERE repository = ? AND status = 'queued'",
        )
        .bind(repository.as_ref())
        .fetch_all(&self.pool)
        .await?;
        let now = Utc::now();
        let total: f64 = rows
            .iter()
            .filter_map(|r| r.try_get::<DateTime<Utc>, _>("created_at").ok())
            .map(|created| (now - created).num_milliseconds() as f64 / 1000.0)
            .sum();
        Ok((depth as u32, total / depth as f64))
    }

    /// Repositories with a queued job or live runner, used to decide which
    /// pools are active.
    pub async fn active_repositories(&self) -> StoreResult<Vec<Repository>> {
        let rows = sqlx::query(
            "SELECT DISTINCT repository FROM job WHERE status IN ('queued', 'assigned', 'running') \
             UNION SELECT DISTINCT repository FROM runner WHERE repository IS NOT NULL AND status != 'offline' \
             UNION SELECT repository FROM runner_pool",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let repo: String = r.try_get("repository")?;
                Repository::new(repo).map_err(|e| StoreError::Corrupt(e.to_string()))
            })
            .collect()
    }

    pub async fn job_counts(&self) -> StoreResult<(u64, u64, u64, u64)> {
        let row = sqlx::query(
            "SELECT \
             SUM(CASE WHEN status = 'queued' THEN 1 ELSE 0 END) AS queued, \
             SUM(CASE WHEN status IN ('assigned','running') THEN 1 ELSE 0 END) AS running, \
             SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed, \
             SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed \
             FROM job",
        )
        .fetch_one(&self.pool)
        .await?;
        let get = |name: &str| -> u64 {
            row.try_get::<Option<i64>, _>(name)
                .ok()
                .flatten()
                .unwrap_or(0) as u64
        };
        Ok((get("queued"), get("running"), get("completed"), get("failed")))
    }

    // ---- runners ----

    #[instrument(level = "debug", skip(self, runner), fields(subsys = "Store", runner = %runner.name))]
    pub async fn insert_runner(&self, runner: &Runner) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO runner (id, name, runner_type, repository, labels, status, container_id, \
             upstream_runner_id, jobs_served, last_heartbeat, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(runner.id.to_string())
        .bind(runner.name.as_ref())
        .bind(runner.runner_type.as_str())
        .bind(runner.repository.as_ref().map(|r| r.to_string()))
        .bind(serde_json::to_string(&runner.labels)?)
        .bind(runner.status.as_str())
        .bind(runner.container_id.as_ref().map(|c| c.to_string()))
        .bind(runner.upstream_runner_id)
        .bind(runner.jobs_served as i64)
        .bind(runner.last_heartbeat)
        .bind(runner.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_runner(&self, id: RunnerId) -> StoreResult<Runner> {
        let row = sqlx::query("SELECT * FROM runner WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("runner {id}")))?;
        runner_from_row(&row)
    }

    pub async fn update_runner_status(
        &self,
        id: RunnerId,
        status: RunnerStatus,
    ) -> StoreResult<()> {
        let result = sqlx::query("UPDATE runner SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("runner {id}")));
        }
        Ok(())
    }

    /// Atomically claim an IDLE runner for a job: IDLE -> BUSY plus the
    /// served-jobs counter, guarded so two dispatchers cannot claim the same
    /// runner.
    pub async fn claim_runner(&self, id: RunnerId) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE runner SET status = 'busy', jobs_served = jobs_served + 1 \
             WHERE id = ? AND status = 'idle'",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn heartbeat_runner(&self, id: RunnerId, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE runner SET last_heartbeat = ? WHERE id = ?")
            .bind(at)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_runner_upstream_id(&self, id: RunnerId, upstream: i64) -> StoreResult<()> {
        sqlx::query("UPDATE runner SET upstream_runner_id = ? WHERE id = ?")
            .bind(upstream)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_runners(
        &self,
        repository: Option<&Repository>,
        status: Option<RunnerStatus>,
        runner_type: Option<RunnerType>,
    ) -> StoreResult<Vec<Runner>> {
        let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> =
            sqlx::QueryBuilder::new("SELECT * FROM runner WHERE 1=1");
        if let Some(repo) = repository {
            qb.push(" AND repository = ").push_bind(repo.to_string());
        }
        if let Some(status) = status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(runner_type) = runner_type {
            qb.push(" AND runner_type = ").push_bind(runner_type.as_str());
        }
        qb.push(" ORDER BY created_at ASC");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(runner_from_row).collect()
    }

    /// Pool size excludes OFFLINE runners.
    pub async fn count_pool_runners(&self, repository: &Repository) -> StoreResult<(u32, u32, u32)> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM runner \
             WHERE repository = ? AND status != 'offline' GROUP BY status",
        )
        .bind(repository.as_ref())
        .fetch_all(&self.pool)
        .await?;
        let mut total = 0u32;
        let mut idle = 0u32;
        let mut busy = 0u32;
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            total += n as u32;
            match status.as_str() {
                "idle" => idle += n as u32,
                "busy" => busy += n as u32,
                _ => {}
            }
        }
        Ok((total, idle, busy))
    }

    pub async fn runner_counts(&self) -> StoreResult<(u64, u64, u64, u64)> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
             SUM(CASE WHEN status = 'idle' THEN 1 ELSE 0 END) AS idle, \
             SUM(CASE WHEN status = 'busy' THEN 1 ELSE 0 END) AS busy, \
             SUM(CASE WHEN status = 'offline' THEN 1 ELSE 0 END) AS offline \
             FROM runner",
        )
        .fetch_one(&self.pool)
        .await?;
        let get = |name: &str| -> u64 {
            row.try_get::<Option<i64>, _>(name)
                .ok()
                .flatten()
                .unwrap_or(0) as u64
        };
        Ok((get("total"), get("idle"), get("busy"), get("offline")))
    }

    // ---- pools ----

    pub async fn upsert_pool(&self, pool: &RunnerPool) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO runner_pool (repository, policy, created_at, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(repository) DO UPDATE SET policy = excluded.policy, updated_at = excluded.updated_at",
        )
        .bind(pool.repository.as_ref())
        .bind(serde_json::to_string(&pool.policy)?)
        .bind(pool.created_at)
        .bind(pool.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_pool(&self, repository: &Repository) -> StoreResult<Option<RunnerPool>> {
        let row = sqlx::query("SELECT * FROM runner_pool WHERE repository = ?")
            .bind(repository.as_ref())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(pool_from_row).transpose()
    }

    pub async fn list_pools(&self) -> StoreResult<Vec<RunnerPool>> {
        let rows = sqlx::query("SELECT * FROM runner_pool ORDER BY repository")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(pool_from_row).collect()
    }

    // ---- routing rules + decisions ----

    pub async fn insert_rule(&self, rule: &RoutingRule) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO routing_rule (id, name, priority, conditions, targets, enabled, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(rule.id.as_ref())
        .bind(&rule.name)
        .bind(rule.priority)
        .bind(serde_json::to_string(&rule.conditions)?)
        .bind(serde_json::to_string(&rule.targets)?)
        .bind(rule.enabled)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_rule(&self, rule: &RoutingRule) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE routing_rule SET name = ?, priority = ?, conditions = ?, targets = ?, \
             enabled = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&rule.name)
        .bind(rule.priority)
        .bind(serde_json::to_string(&rule.conditions)?)
        .bind(serde_json::to_string(&rule.targets)?)
        .bind(rule.enabled)
        .bind(rule.updated_at)
        .bind(rule.id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("rule {}", rule.id)));
        }
        Ok(())
    }

    pub async fn delete_rule(&self, id: &RuleId) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM routing_rule WHERE id = ?")
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("rule {id}")));
        }
        Ok(())
    }

    pub async fn list_rules(&self, enabled_only: bool) -> StoreResult<Vec<RoutingRule>> {
        let sql = if enabled_only {
            "SELECT * FROM routing_rule WHERE enabled = 1 ORDER BY priority DESC, id"
        } else {
            "SELECT * FROM routing_rule ORDER BY priority DESC, id"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(rule_from_row).collect()
    }

    pub async fn insert_decision(&self, decision: &RoutingDecision) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO routing_decision (job_id, matched_rule_id, selected_runner_id, \
             candidate_count, reason, timestamp) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(decision.job_id.to_string())
        .bind(decision.matched_rule_id.as_ref().map(|r| r.to_string()))
        .bind(decision.selected_runner_id.map(|r| r.to_string()))
        .bind(decision.candidate_count)
        .bind(&decision.reason)
        .bind(decision.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- containers ----

    pub async fn insert_container(&self, record: &ContainerRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO container (id, job_id, runner_id, repository, image, state, resources, \
             labels, network_id, created_at, started_at, finished_at, exit_code, last_sample, \
             last_sampled_at, healthy) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.job_id.map(|j| j.to_string()))
        .bind(record.runner_id.map(|r| r.to_string()))
        .bind(record.repository.as_ref())
        .bind(&record.image)
        .bind(record.state.as_str())
        .bind(serde_json::to_string(&record.resources)?)
        .bind(serde_json::to_string(&record.labels)?)
        .bind(&record.network_id)
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.exit_code)
        .bind(
            record
                .last_sample
                .map(|s| serde_json::to_string(&s))
                .transpose()?,
        )
        .bind(record.last_sampled_at)
        .bind(record.healthy)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_container(&self, id: &ContainerId) -> StoreResult<ContainerRecord> {
        let row = sqlx::query("SELECT * FROM container WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("container {id}")))?;
        container_from_row(&row)
    }

    /// Advance a container's state, enforcing the machine. Returns the prior
    /// state.
    pub async fn transition_container(
        &self,
        id: &ContainerId,
        next: ContainerState,
    ) -> StoreResult<ContainerState> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT state FROM container WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("container {id}")))?;
        let current: String = row.try_get("state")?;
        let current = ContainerState::from_str(&current)
            .map_err(StoreError::Corrupt)?;

        if !current.can_transition_to(next) {
            return Err(StoreError::IllegalTransition(format!(
                "container {} cannot go {} -> {}",
                id,
                current.as_str(),
                next.as_str()
            )));
        }

        let now = Utc::now();
        let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> =
            sqlx::QueryBuilder::new("UPDATE container SET state = ");
        qb.push_bind(next.as_str());
        if next == ContainerState::Running {
            qb.push(", started_at = ").push_bind(now);
        }
        if matches!(next, ContainerState::Stopped | ContainerState::Error) {
            qb.push(", finished_at = ").push_bind(now);
        }
        qb.push(" WHERE id = ").push_bind(id.to_string());
        qb.build().execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(current)
    }

    pub async fn set_container_network(
        &self,
        id: &ContainerId,
        network_id: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE container SET network_id = ? WHERE id = ?")
            .bind(network_id)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_container_exit_code(
        &self,
        id: &ContainerId,
        exit_code: i64,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE container SET exit_code = ? WHERE id = ?")
            .bind(exit_code)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_container_sample(
        &self,
        id: &ContainerId,
        sample: &ResourceSample,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE container SET last_sample = ?, last_sampled_at = ? WHERE id = ?")
            .bind(serde_json::to_string(sample)?)
            .bind(at)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_container_health(&self, id: &ContainerId, healthy: bool) -> StoreResult<()> {
        sqlx::query("UPDATE container SET healthy = ? WHERE id = ?")
            .bind(healthy)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_container(&self, id: &ContainerId) -> StoreResult<()> {
        sqlx::query("DELETE FROM container WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_containers(
        &self,
        state: Option<ContainerState>,
        repository: Option<&Repository>,
    ) -> StoreResult<Vec<ContainerRecord>> {
        let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> =
            sqlx::QueryBuilder::new("SELECT * FROM container WHERE 1=1");
        if let Some(state) = state {
            qb.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(repo) = repository {
            qb.push(" AND repository = ").push_bind(repo.to_string());
        }
        qb.push(" ORDER BY created_at ASC");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(container_from_row).collect()
    }

    // ---- networks ----

    pub async fn insert_network(&self, network: &Network) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO network (id, name, repository, subnet, gateway, internal, created_at, \
             last_used, removed_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&network.id)
        .bind(&network.name)
        .bind(network.repository.as_ref())
        .bind(network.subnet.to_string())
        .bind(network.gateway.to_string())
        .bind(network.internal)
        .bind(network.created_at)
        .bind(network.last_used)
        .bind(network.removed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn active_network_for_repo(
        &self,
        repository: &Repository,
    ) -> StoreResult<Option<Network>> {
        let row = sqlx::query(
            "SELECT * FROM network WHERE repository = ? AND removed_at IS NULL",
        )
        .bind(repository.as_ref())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(network_from_row).transpose()
    }

    pub async fn active_networks(&self) -> StoreResult<Vec<Network>> {
        let rows = sqlx::query("SELECT * FROM network WHERE removed_at IS NULL ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(network_from_row).collect()
    }

    pub async fn touch_network(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE network SET last_used = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_network_removed(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE network SET removed_at = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- webhook events ----

    pub async fn insert_webhook_event(&self, event: &WebhookEvent) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO webhook_event (delivery_id, event_type, action, repository, payload, \
             signature_verified, received_at, processed_at, attempts, last_error) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.delivery_id)
        .bind(&event.event_type)
        .bind(&event.action)
        .bind(event.repository.as_ref().map(|r| r.to_string()))
        .bind(serde_json::to_string(&event.payload)?)
        .bind(event.signature_verified)
        .bind(event.received_at)
        .bind(event.processed_at)
        .bind(event.attempts)
        .bind(&event.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_webhook_event(&self, delivery_id: &str) -> StoreResult<WebhookEvent> {
        let row = sqlx::query("SELECT * FROM webhook_event WHERE delivery_id = ?")
            .bind(delivery_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("webhook delivery {delivery_id}")))?;
        webhook_from_row(&row)
    }

    pub async fn mark_webhook_processed(
        &self,
        delivery_id: &str,
        error: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE webhook_event SET processed_at = ?, attempts = attempts + 1, last_error = ? \
             WHERE delivery_id = ?",
        )
        .bind(Utc::now())
        .bind(error)
        .bind(delivery_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn failed_webhook_events(&self, cap: i64) -> StoreResult<Vec<WebhookEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM webhook_event WHERE last_error IS NOT NULL \
             ORDER BY received_at DESC LIMIT ?",
        )
        .bind(cap)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(webhook_from_row).collect()
    }

    // ---- scaling events ----

    pub async fn insert_scaling_event(&self, event: &ScalingEvent) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO scaling_event (repository, direction, before_count, after_count, \"trigger\", timestamp) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event.repository.as_ref())
        .bind(event.direction.as_str())
        .bind(event.before)
        .bind(event.after)
        .bind(event.trigger.as_str())
        .bind(event.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_scaling_events(
        &self,
        repository: &Repository,
        limit: i64,
    ) -> StoreResult<Vec<ScalingEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM scaling_event WHERE repository = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(repository.as_ref())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(scaling_from_row).collect()
    }

    // ---- cleanup history ----

    pub async fn insert_cleanup_history(&self, history: &CleanupHistory) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO cleanup_history (ran_at, evaluated, stopped, removed, archived, failed, details) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(history.ran_at.unwrap_or_else(Utc::now))
        .bind(history.evaluated)
        .bind(history.stopped)
        .bind(history.removed)
        .bind(history.archived)
        .bind(history.failed)
        .bind(serde_json::to_string(&history.details)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---- row mapping ----

fn parse_repo(s: String) -> StoreResult<Repository> {
    Repository::new(s).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn parse_id<T: FromStr>(s: String, what: &str) -> StoreResult<T> {
    s.parse()
        .map_err(|_| StoreError::Corrupt(format!("bad {what}: {s}")))
}

fn job_from_row(row: &SqliteRow) -> StoreResult<Job> {
    let labels: String = row.try_get("labels")?;
    let status: String = row.try_get("status")?;
    let priority: i64 = row.try_get("priority")?;
    Ok(Job {
        id: parse_id(row.try_get("id")?, "job id")?,
        upstream_job_id: row.try_get("upstream_job_id")?,
        upstream_run_id: row.try_get("upstream_run_id")?,
        repository: parse_repo(row.try_get("repository")?)?,
        workflow: row.try_get("workflow")?,
        labels: serde_json::from_str::<BTreeSet<String>>(&labels)?,
        priority: JobPriority::from_band(priority)
            .ok_or_else(|| StoreError::Corrupt(format!("bad priority band {priority}")))?,
        status: JobStatus::from_str(&status).map_err(StoreError::Corrupt)?,
        assigned_runner_id: row
            .try_get::<Option<String>, _>("assigned_runner_id")?
            .map(|s| parse_id(s, "runner id"))
            .transpose()?,
        container_id: row
            .try_get::<Option<String>, _>("container_id")?
            .map(ContainerId::new),
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error: row.try_get("error")?,
    })
}

fn runner_from_row(row: &SqliteRow) -> StoreResult<Runner> {
    let labels: String = row.try_get("labels")?;
    let status: String = row.try_get("status")?;
    let runner_type: String = row.try_get("runner_type")?;
    let jobs_served: i64 = row.try_get("jobs_served")?;
    Ok(Runner {
        id: parse_id(row.try_get("id")?, "runner id")?,
        name: RunnerName::new(row.try_get::<String, _>("name")?)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        runner_type: RunnerType::from_str(&runner_type).map_err(StoreError::Corrupt)?,
        repository: row
            .try_get::<Option<String>, _>("repository")?
            .map(parse_repo)
            .transpose()?,
        labels: serde_json::from_str::<BTreeSet<String>>(&labels)?,
        status: RunnerStatus::from_str(&status).map_err(StoreError::Corrupt)?,
        container_id: row
            .try_get::<Option<String>, _>("container_id")?
            .map(ContainerId::new),
        upstream_runner_id: row.try_get("upstream_runner_id")?,
        jobs_served: jobs_served as u64,
        last_heartbeat: row.try_get("last_heartbeat")?,
        created_at: row.try_get("created_at")?,
    })
}

fn pool_from_row(row: &SqliteRow) -> StoreResult<RunnerPool> {
    let policy: String = row.try_get("policy")?;
    Ok(RunnerPool {
        repository: parse_repo(row.try_get("repository")?)?,
        policy: serde_json::from_str::<PoolPolicy>(&policy)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn rule_from_row(row: &SqliteRow) -> StoreResult<RoutingRule> {
    let conditions: String = row.try_get("conditions")?;
    let targets: String = row.try_get("targets")?;
    Ok(RoutingRule {
        id: RuleId::new(row.try_get::<String, _>("id")?)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        name: row.try_get("name")?,
        priority: row.try_get("priority")?,
        conditions: serde_json::from_str(&conditions)?,
        targets: serde_json::from_str(&targets)?,
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn container_from_row(row: &SqliteRow) -> StoreResult<ContainerRecord> {
    let state: String = row.try_get("state")?;
    let resources: String = row.try_get("resources")?;
    let labels: String = row.try_get("labels")?;
    Ok(ContainerRecord {
        id: ContainerId::new(row.try_get::<String, _>("id")?),
        job_id: row
            .try_get::<Option<String>, _>("job_id")?
            .map(|s| parse_id(s, "job id"))
            .transpose()?,
        runner_id: row
            .try_get::<Option<String>, _>("runner_id")?
            .map(|s| parse_id(s, "runner id"))
            .transpose()?,
        repository: parse_repo(row.try_get("repository")?)?,
        image: row.try_get("image")?,
        state: ContainerState::from_str(&state).map_err(StoreError::Corrupt)?,
        resources: serde_json::from_str::<ResourceLimits>(&resources)?,
        labels: serde_json::from_str::<BTreeMap<String, String>>(&labels)?,
        network_id: row.try_get("network_id")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        exit_code: row.try_get("exit_code")?,
        last_sample: row
            .try_get::<Option<String>, _>("last_sample")?
            .map(|s| serde_json::from_str::<ResourceSample>(&s))
            .transpose()?,
        last_sampled_at: row.try_get("last_sampled_at")?,
        healthy: row.try_get("healthy")?,
    })
}

fn network_from_row(row: &SqliteRow) -> StoreResult<Network> {
    let subnet: String = row.try_get("subnet")?;
    let gateway: String = row.try_get("gateway")?;
    Ok(Network {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        repository: parse_repo(row.try_get("repository")?)?,
        subnet: subnet
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("bad subnet: {subnet}")))?,
        gateway: gateway
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("bad gateway: {gateway}")))?,
        internal: row.try_get("internal")?,
        created_at: row.try_get("created_at")?,
        last_used: row.try_get("last_used")?,
        removed_at: row.try_get("removed_at")?,
    })
}

fn webhook_from_row(row: &SqliteRow) -> StoreResult<WebhookEvent> {
    let payload: String = row.try_get("payload")?;
    Ok(WebhookEvent {
        delivery_id: row.try_get("delivery_id")?,
        event_type: row.try_get("event_type")?,
        action: row.try_get("action")?,
        repository: row
            .try_get::<Option<String>, _>("repository")?
            .map(parse_repo)
            .transpose()?,
        payload: serde_json::from_str(&payload)?,
        signature_verified: row.try_get("signature_verified")?,
        received_at: row.try_get("received_at")?,
        processed_at: row.try_get("processed_at")?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        last_error: row.try_get("last_error")?,
    })
}

fn scaling_from_row(row: &SqliteRow) -> StoreResult<ScalingEvent> {
    let direction: String = row.try_get("direction")?;
    let trigger: String = row.try_get("trigger")?;
    let direction = match direction.as_str() {
        "up" => ScaleDirection::Up,
        "down" => ScaleDirection::Down,
        "none" => ScaleDirection::None,
        other => return Err(StoreError::Corrupt(format!("bad direction: {other}"))),
    };
    let trigger = match trigger.as_str() {
        "queue_depth" => ScalingTrigger::QueueDepth,
        "utilization" => ScalingTrigger::Utilization,
        "wait_time" => ScalingTrigger::WaitTime,
        "below_min" => ScalingTrigger::BelowMin,
        "idle" => ScalingTrigger::Idle,
        "predicted" => ScalingTrigger::Predicted,
        "forced" => ScalingTrigger::Forced,
        other => return Err(StoreError::Corrupt(format!("bad trigger: {other}"))),
    };
    Ok(ScalingEvent {
        repository: parse_repo(row.try_get("repository")?)?,
        direction,
        before: row.try_get::<i64, _>("before_count")? as u32,
        after: row.try_get::<i64, _>("after_count")? as u32,
        trigger,
        timestamp: row.try_get("timestamp")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::store::temp_store;

    fn sample_job(repo: &str, upstream_id: i64) -> Job {
        Job {
            id: JobId::generate(),
            upstream_job_id: upstream_id,
            upstream_run_id: 100,
            repository: Repository::new(repo).unwrap(),
            workflow: "ci".to_string(),
            labels: ["self-hosted", "linux"].iter().map(|s| s.to_string()).collect(),
            priority: JobPriority::Normal,
            status: JobStatus::Queued,
            assigned_runner_id: None,
            container_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn job_round_trip_and_transitions() {
        let (store, _dir) = temp_store().await;
        let job = sample_job("org/repo1", 1);
        store.insert_job(&job).await.unwrap();

        let loaded = store.get_job(job.id).await.unwrap();
        assert_eq!(loaded, job);

        let runner_id = RunnerId::generate();
        let assigned = store.assign_job(job.id, runner_id, None).await.unwrap();
        assert_eq!(assigned.status, JobStatus::Assigned);

        let running = store
            .transition_job(job.id, JobStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());

        let done = store
            .transition_job(job.id, JobStatus::Completed, None)
            .await
            .unwrap();
        assert!(done.completed_at.is_some());

        // terminal states stay put
        let err = store
            .transition_job(job.id, JobStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition(_)));
    }

    #[tokio::test]
    async fn duplicate_upstream_job_conflicts() {
        let (store, _dir) = temp_store().await;
        store.insert_job(&sample_job("org/repo1", 7)).await.unwrap();
        let err = store
            .insert_job(&sample_job("org/repo1", 7))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // same upstream id in another repo is fine
        store.insert_job(&sample_job("org/repo2", 7)).await.unwrap();
    }

    #[tokio::test]
    async fn claim_runner_is_single_winner() {
        let (store, _dir) = temp_store().await;
        let runner = Runner {
            id: RunnerId::generate(),
            name: RunnerName::new("hub-ephemeral-org-repo1-abcd").unwrap(),
            runner_type: RunnerType::Ephemeral,
            repository: Some(Repository::new("org/repo1").unwrap()),
            labels: BTreeSet::new(),
            status: RunnerStatus::Idle,
            container_id: None,
            upstream_runner_id: None,
            jobs_served: 0,
            last_heartbeat: None,
            created_at: Utc::now(),
        };
        store.insert_runner(&runner).await.unwrap();

        assert!(store.claim_runner(runner.id).await.unwrap());
        // second claim loses; the runner is already BUSY
        assert!(!store.claim_runner(runner.id).await.unwrap());

        let loaded = store.get_runner(runner.id).await.unwrap();
        assert_eq!(loaded.status, RunnerStatus::Busy);
        assert_eq!(loaded.jobs_served, 1);
    }

    #[tokio::test]
    async fn one_active_network_per_repo() {
        let (store, _dir) = temp_store().await;
        let repo = Repository::new("org/repo1").unwrap();
        let net = Network {
            id: "n1".to_string(),
            name: Network::name_for(&repo),
            repository: repo.clone(),
            subnet: "10.100.1.0/24".parse().unwrap(),
            gateway: "10.100.1.1".parse().unwrap(),
            internal: true,
            created_at: Utc::now(),
            last_used: Utc::now(),
            removed_at: None,
        };
        store.insert_network(&net).await.unwrap();

        let dup = Network {
            id: "n2".to_string(),
            subnet: "10.100.2.0/24".parse().unwrap(),
            ..net.clone()
        };
        assert!(matches!(
            store.insert_network(&dup).await.unwrap_err(),
            StoreError::Conflict(_)
        ));

        // after removal a fresh one is allowed
        store.mark_network_removed("n1", Utc::now()).await.unwrap();
        store.insert_network(&dup).await.unwrap();
    }

    #[tokio::test]
    async fn queued_stats_counts_only_queued() {
        let (store, _dir) = temp_store().await;
        let repo = Repository::new("org/repo2").unwrap();
        for i in 0..3 {
            store.insert_job(&sample_job("org/repo2", i)).await.unwrap();
        }
        let done = sample_job("org/repo2", 99);
        store.insert_job(&done).await.unwrap();
        store
            .transition_job(done.id, JobStatus::Cancelled, None)
            .await
            .unwrap();

        let (depth, wait) = store.queued_stats(&repo).await.unwrap();
        assert_eq!(depth, 3);
        assert!(wait >= 0.0);
    }
}
