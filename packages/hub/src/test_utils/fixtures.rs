use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};

use runnerhub_types::{
    Job, JobId, JobPriority, JobStatus, Repository, RoutingRule, RuleConditions, RuleId,
    RuleTargets, Runner, RunnerId, RunnerName, RunnerStatus, RunnerType,
};

static NEXT_UPSTREAM_ID: AtomicI64 = AtomicI64::new(1);

fn labels(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// A QUEUED job with a unique upstream id.
pub fn queued_job(repo: &str, job_labels: &[&str]) -> Job {
    let upstream_id = NEXT_UPSTREAM_ID.fetch_add(1, Ordering::Relaxed);
    Job {
        id: JobId::generate(),
        upstream_job_id: upstream_id,
        upstream_run_id: 1000 + upstream_id,
        repository: Repository::new(repo).unwrap(),
        workflow: "ci".to_string(),
        labels: labels(job_labels),
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

/// An enabled routing rule.
pub fn rule(
    id: &str,
    priority: i32,
    condition_labels: &[&str],
    runner_labels: &[&str],
    exclusive: bool,
) -> RoutingRule {
    let now = Utc::now();
    RoutingRule {
        id: RuleId::new(id).unwrap(),
        name: id.to_string(),
        priority,
        conditions: RuleConditions {
            labels: labels(condition_labels),
            ..Default::default()
        },
        targets: RuleTargets {
            runner_labels: labels(runner_labels),
            pool_override: None,
            exclusive,
        },
        enabled: true,
        created_at: now,
        updated_at: now,
    }
}

/// A dedicated runner with a unique name; caller inserts it into the store.
pub fn runner_with(repo: &str, runner_labels: &[&str], status: RunnerStatus) -> Runner {
    let id = RunnerId::generate();
    let nonce = NEXT_UPSTREAM_ID.fetch_add(1, Ordering::Relaxed);
    Runner {
        id,
        name: RunnerName::new(format!("fixture-runner-{nonce}")).unwrap(),
        runner_type: RunnerType::Dedicated,
        repository: Some(Repository::new(repo).unwrap()),
        labels: labels(runner_labels),
        status,
        container_id: None,
        upstream_runner_id: None,
        jobs_served: 0,
        last_heartbeat: Some(Utc::now()),
        created_at: Utc::now(),
    }
}
