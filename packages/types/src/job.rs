use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use utoipa::ToSchema;

use crate::{ContainerId, JobId, Repository, RunnerId};

/// Priority band a job is enqueued on. Higher bands drain first.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl JobPriority {
    /// Integer band for queue ordering. Lower sorts first.
    pub fn band(&self) -> i64 {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }

    pub fn from_band(band: i64) -> Option<Self> {
        match band {
            0 => Some(JobPriority::Critical),
            1 => Some(JobPriority::High),
            2 => Some(JobPriority::Normal),
            3 => Some(JobPriority::Low),
            _ => None,
        }
    }

    pub fn all() -> [JobPriority; 4] {
        [
            JobPriority::Critical,
            JobPriority::High,
            JobPriority::Normal,
            JobPriority::Low,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Critical => "critical",
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Status only ever advances along
    /// `QUEUED -> (ASSIGNED -> RUNNING)? -> (COMPLETED|FAILED|CANCELLED)`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Assigned) => true,
            (Queued, Running) => true,
            (Assigned, Running) => true,
            (Queued | Assigned | Running, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Assigned => "assigned",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "assigned" => Ok(JobStatus::Assigned),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// One unit of work produced by an upstream workflow run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct Job {
    pub id: JobId,
    pub upstream_job_id: i64,
    pub upstream_run_id: i64,
    pub repository: Repository,
    pub workflow: String,
    /// Labels requested by the workflow (e.g. `self-hosted`, `linux`)
    pub labels: BTreeSet<String>,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub assigned_runner_id: Option<RunnerId>,
    pub container_id: Option<ContainerId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Job {
    pub fn wait_time(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.started_at.unwrap_or(now) - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_advances_monotonically() {
        use JobStatus::*;

        assert!(Queued.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Queued.can_transition_to(Cancelled));

        // no going back, no leaving terminal states
        assert!(!Assigned.can_transition_to(Queued));
        assert!(!Running.can_transition_to(Assigned));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Cancelled.can_transition_to(Assigned));
    }

    #[test]
    fn band_round_trip() {
        for p in JobPriority::all() {
            assert_eq!(JobPriority::from_band(p.band()), Some(p));
        }
        assert_eq!(JobPriority::from_band(9), None);
    }
}
