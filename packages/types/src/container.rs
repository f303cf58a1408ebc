use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

use crate::{ContainerId, JobId, Repository, RunnerId};

/// Runtime-side container state machine:
///
/// ```text
/// CREATING -> CREATED -> STARTING -> RUNNING -> STOPPING -> STOPPED -> REMOVING -> REMOVED
///                                        |
///                                      ERROR -> REMOVING -> REMOVED
/// ```
///
/// ERROR is reachable from any non-terminal state.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Creating,
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Removing,
    Removed,
    Error,
}

impl ContainerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerState::Removed)
    }

    pub fn can_transition_to(&self, next: ContainerState) -> bool {
        use ContainerState::*;
        if next == Error {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Creating, Created)
                | (Created, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Removing)
                // containers that never reached RUNNING are removed directly
                | (Created, Removing)
                | (Error, Removing)
                // a force-kill of an errored workload records the stop, so
                // removal of anything that ran always passes through STOPPED
                | (Error, Stopped)
                | (Removing, Removed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Creating => "creating",
            ContainerState::Created => "created",
            ContainerState::Starting => "starting",
            ContainerState::Running => "running",
            ContainerState::Stopping => "stopping",
            ContainerState::Stopped => "stopped",
            ContainerState::Removing => "removing",
            ContainerState::Removed => "removed",
            ContainerState::Error => "error",
        }
    }
}

impl std::str::FromStr for ContainerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(ContainerState::Creating),
            "created" => Ok(ContainerState::Created),
            "starting" => Ok(ContainerState::Starting),
            "running" => Ok(ContainerState::Running),
            "stopping" => Ok(ContainerState::Stopping),
            "stopped" => Ok(ContainerState::Stopped),
            "removing" => Ok(ContainerState::Removing),
            "removed" => Ok(ContainerState::Removed),
            "error" => Ok(ContainerState::Error),
            other => Err(format!("unknown container state: {other}")),
        }
    }
}

/// Hard limits applied at container creation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, ToSchema)]
pub struct ResourceLimits {
    /// CPUs, fractional (1.5 = one and a half cores)
    pub cpu_limit: f64,
    pub mem_limit_bytes: u64,
    pub pids_limit: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_limit: 2.0,
            mem_limit_bytes: 4 * 1024 * 1024 * 1024,
            pids_limit: 512,
        }
    }
}

/// A point-in-time resource sample, produced by differencing successive
/// runtime stats reads.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, ToSchema)]
pub struct ResourceSample {
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub mem_bytes: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
}

/// What the lifecycle manager composes and hands to the runtime.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub resources: ResourceLimits,
    pub read_only_root: bool,
    pub repository: Repository,
    pub job_id: Option<JobId>,
    pub runner_id: Option<RunnerId>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct ContainerRecord {
    pub id: ContainerId,
    pub job_id: Option<JobId>,
    pub runner_id: Option<RunnerId>,
    pub repository: Repository,
    pub image: String,
    pub state: ContainerState,
    pub resources: ResourceLimits,
    pub labels: BTreeMap<String, String>,
    pub network_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub last_sample: Option<ResourceSample>,
    pub last_sampled_at: Option<DateTime<Utc>>,
    pub healthy: bool,
}

impl ContainerRecord {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    /// Labels that exempt a container from every cleanup policy.
    pub fn cleanup_exempt(&self) -> bool {
        self.labels.get("persistent").map(String::as_str) == Some("true")
            || self.labels.get("no-cleanup").map(String::as_str) == Some("true")
    }
}

/// Outcome of one cleanup run, with per-container failures recorded rather
/// than aborting the batch.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, ToSchema)]
pub struct CleanupHistory {
    pub ran_at: Option<DateTime<Utc>>,
    pub evaluated: u32,
    pub stopped: u32,
    pub removed: u32,
    pub archived: u32,
    pub failed: u32,
    pub details: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        use ContainerState::*;
        let path = [
            Creating, Created, Starting, Running, Stopping, Stopped, Removing, Removed,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{:?} -> {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn error_reachable_from_non_terminal() {
        use ContainerState::*;
        for state in [Creating, Created, Starting, Running, Stopping, Stopped] {
            assert!(state.can_transition_to(Error));
        }
        assert!(!Removed.can_transition_to(Error));
        assert!(Error.can_transition_to(Removing));
        // a force-killed errored workload lands in STOPPED before removal
        assert!(Error.can_transition_to(Stopped));
    }

    #[test]
    fn removed_requires_removing() {
        use ContainerState::*;
        assert!(!Running.can_transition_to(Removed));
        assert!(!Stopped.can_transition_to(Removed));
        assert!(Removing.can_transition_to(Removed));
    }

    #[test]
    fn cleanup_exemption_labels() {
        let mut record = ContainerRecord {
            id: crate::ContainerId::new("c1"),
            job_id: None,
            runner_id: None,
            repository: crate::Repository::new("org/repo1").unwrap(),
            image: "runner:latest".to_string(),
            state: ContainerState::Running,
            resources: ResourceLimits::default(),
            labels: BTreeMap::new(),
            network_id: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            last_sample: None,
            last_sampled_at: None,
            healthy: true,
        };
        assert!(!record.cleanup_exempt());

        record
            .labels
            .insert("persistent".to_string(), "true".to_string());
        assert!(record.cleanup_exempt());
    }
}
