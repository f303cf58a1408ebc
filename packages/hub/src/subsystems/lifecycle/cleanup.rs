use chrono::{Duration, Utc};
use std::collections::BTreeSet;

use runnerhub_types::{CleanupHistory, ContainerRecord, ContainerState};

use super::{LifecycleManager, LifecycleResult};

/// The enable-able cleanup rules, evaluated in declaration order. The first
/// matching policy decides the container's fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CleanupPolicy {
    /// RUNNING with no live job past the idle TTL
    Idle,
    /// STOPPED with a non-zero exit, older than the failed age
    Failed,
    /// No matching job or runner, older than the orphan age
    Orphaned,
    /// Alive past the maximum lifetime
    Expired,
}

impl CleanupPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupPolicy::Idle => "idle",
            CleanupPolicy::Failed => "failed",
            CleanupPolicy::Orphaned => "orphaned",
            CleanupPolicy::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub enabled: BTreeSet<CleanupPolicy>,
    pub idle_ttl_s: u64,
    pub failed_age_s: u64,
    pub orphaned_age_s: u64,
    pub max_lifetime_s: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: [
                CleanupPolicy::Idle,
                CleanupPolicy::Failed,
                CleanupPolicy::Orphaned,
                CleanupPolicy::Expired,
            ]
            .into(),
            idle_ttl_s: 30 * 60,
            failed_age_s: 10 * 60,
            orphaned_age_s: 60 * 60,
            max_lifetime_s: 24 * 60 * 60,
        }
    }
}

enum Action {
    StopRemoveArchive,
    RemoveArchive,
    Remove,
}

impl LifecycleManager {
    /// One cleanup pass over every container record. Individual failures are
    /// recorded in the run's detail list and do not abort the batch.
    pub async fn run_cleanup(&self) -> LifecycleResult<CleanupHistory> {
        let config = self.config.cleanup.clone();
        let now = Utc::now();
        let mut history = CleanupHistory {
            ran_at: Some(now),
            ..Default::default()
        };

        let records = self.store.list_containers(None, None).await?;
        for record in records {
            history.evaluated += 1;

            if record.cleanup_exempt() {
                continue;
            }
            let Some(policy) = self.select_policy(&config, &record, now).await? else {
                continue;
            };

            let action = match policy {
                CleanupPolicy::Idle | CleanupPolicy::Expired => Action::StopRemoveArchive,
                CleanupPolicy::Failed => Action::RemoveArchive,
                CleanupPolicy::Orphaned => Action::Remove,
            };

            tracing::info!(
                "Cleanup: policy={}, container={}, repo={}",
                policy.as_str(),
                record.id,
                record.repository
            );
            let result = match action {
                Action::StopRemoveArchive => {
                    let stopped = record.state == ContainerState::Running;
                    let stop = if stopped {
                        self.stop(&record.id, None).await
                    } else {
                        Ok(())
                    };
                    match stop {
                        Ok(()) => self.remove(&record.id, true).await.map(|()| {
                            if stopped {
                                history.stopped += 1;
                            }
                            history.archived += 1;
                        }),
                        Err(e) => Err(e),
                    }
                }
                Action::RemoveArchive => self
                    .remove(&record.id, true)
                    .await
                    .map(|()| history.archived += 1),
                Action::Remove => self.remove(&record.id, true).await,
            };

            match result {
                Ok(()) => {
                    history.removed += 1;
                    self.metrics.cleanups.add(1, &[]);
                }
                Err(err) => {
                    history.failed += 1;
                    self.metrics.cleanup_errors.add(1, &[]);
                    history.details.push(format!(
                        "{}: {} ({})",
                        record.id,
                        err,
                        policy.as_str()
                    ));
                }
            }
        }

        self.store.insert_cleanup_history(&history).await?;
        Ok(history)
    }

    async fn select_policy(
        &self,
        config: &CleanupConfig,
        record: &ContainerRecord,
        now: chrono::DateTime<Utc>,
    ) -> LifecycleResult<Option<CleanupPolicy>> {
        let age = record.age(now);

        if config.enabled.contains(&CleanupPolicy::Idle)
            && record.state == ContainerState::Running
            && age >= Duration::seconds(config.idle_ttl_s as i64)
            && self.job_is_gone(record).await?
        {
            return Ok(Some(CleanupPolicy::Idle));
        }

        if config.enabled.contains(&CleanupPolicy::Failed)
            && record.state == ContainerState::Stopped
            && record.exit_code.is_some_and(|code| code != 0)
            && record
                .finished_at
                .is_some_and(|at| now - at >= Duration::seconds(config.failed_age_s as i64))
        {
            return Ok(Some(CleanupPolicy::Failed));
        }

        if config.enabled.contains(&CleanupPolicy::Orphaned)
            && age >= Duration::seconds(config.orphaned_age_s as i64)
            && self.is_orphan(record).await?
        {
            return Ok(Some(CleanupPolicy::Orphaned));
        }

        if config.enabled.contains(&CleanupPolicy::Expired)
            && age >= Duration::seconds(config.max_lifetime_s as i64)
        {
            return Ok(Some(CleanupPolicy::Expired));
        }

        Ok(None)
    }

    async fn job_is_gone(&self, record: &ContainerRecord) -> LifecycleResult<bool> {
        match record.job_id {
            None => Ok(true),
            Some(job_id) => match self.store.get_job(job_id).await {
                Ok(job) => Ok(job.status.is_terminal()),
                Err(crate::storage::StoreError::NotFound(_)) => Ok(true),
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn is_orphan(&self, record: &ContainerRecord) -> LifecycleResult<bool> {
        let job_live = match record.job_id {
            Some(job_id) => match self.store.get_job(job_id).await {
                Ok(job) => !job.status.is_terminal(),
                Err(crate::storage::StoreError::NotFound(_)) => false,
                Err(e) => return Err(e.into()),
            },
            None => false,
        };
        if job_live {
            return Ok(false);
        }

        let runner_live = match record.runner_id {
            Some(runner_id) => match self.store.get_runner(runner_id).await {
                Ok(runner) => runner.status != runnerhub_types::RunnerStatus::Offline,
                Err(crate::storage::StoreError::NotFound(_)) => false,
                Err(e) => return Err(e.into()),
            },
            None => false,
        };
        Ok(!runner_live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::lifecycle::{sample_spec, test_manager_with_cleanup};

    fn fast_cleanup() -> CleanupConfig {
        CleanupConfig {
            idle_ttl_s: 0,
            failed_age_s: 0,
            orphaned_age_s: 0,
            max_lifetime_s: 3600,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn idle_running_container_is_cleaned() {
        let (manager, _runtime, _dir) = test_manager_with_cleanup(fast_cleanup()).await;
        let record = manager.create(&sample_spec("org/repo1")).await.unwrap();
        manager.start(&record.id).await.unwrap();

        let history = manager.run_cleanup().await.unwrap();
        assert_eq!(history.evaluated, 1);
        assert_eq!(history.stopped, 1);
        assert_eq!(history.removed, 1);
        assert_eq!(history.failed, 0);
        assert!(manager.store().get_container(&record.id).await.is_err());
    }

    #[tokio::test]
    async fn persistent_label_is_exempt() {
        let (manager, _runtime, _dir) = test_manager_with_cleanup(fast_cleanup()).await;
        let mut spec = sample_spec("org/repo1");
        spec.labels
            .insert("persistent".to_string(), "true".to_string());
        let record = manager.create(&spec).await.unwrap();
        manager.start(&record.id).await.unwrap();

        let history = manager.run_cleanup().await.unwrap();
        assert_eq!(history.removed, 0);
        assert!(manager.store().get_container(&record.id).await.is_ok());
    }

    #[tokio::test]
    async fn failed_container_removed_after_age() {
        let (manager, runtime, _dir) = test_manager_with_cleanup(fast_cleanup()).await;
        let record = manager.create(&sample_spec("org/repo1")).await.unwrap();
        manager.start(&record.id).await.unwrap();
        runtime.set_exit_code(&record.id, 2).await;
        manager.stop(&record.id, Some(0)).await.unwrap();

        let history = manager.run_cleanup().await.unwrap();
        assert_eq!(history.removed, 1);
        assert_eq!(history.archived, 1);
    }

    #[tokio::test]
    async fn individual_failure_does_not_abort_batch() {
        let (manager, runtime, _dir) = test_manager_with_cleanup(fast_cleanup()).await;
        let poisoned = manager.create(&sample_spec("org/repo1")).await.unwrap();
        manager.start(&poisoned.id).await.unwrap();
        let healthy = manager.create(&sample_spec("org/repo2")).await.unwrap();
        manager.start(&healthy.id).await.unwrap();

        runtime.fail_stop_for(&poisoned.id).await;

        let history = manager.run_cleanup().await.unwrap();
        assert_eq!(history.failed, 1);
        assert_eq!(history.removed, 1);
        assert_eq!(history.details.len(), 1);
        assert!(history.details[0].contains(poisoned.id.as_ref()));
    }

    #[tokio::test]
    async fn disabled_policy_is_skipped() {
        let (manager, _runtime, _dir) = test_manager_with_cleanup(CleanupConfig {
            enabled: [CleanupPolicy::Failed].into(),
            idle_ttl_s: 0,
            ..Default::default()
        })
        .await;
        let record = manager.create(&sample_spec("org/repo1")).await.unwrap();
        manager.start(&record.id).await.unwrap();

        let history = manager.run_cleanup().await.unwrap();
        assert_eq!(history.removed, 0);
        assert!(manager.store().get_container(&record.id).await.is_ok());
    }
}
