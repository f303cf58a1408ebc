use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use utoipa::ToSchema;

use crate::{ContainerId, Repository, RunnerId, RunnerName};

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RunnerType {
    /// Long-lived runner that only intercepts and forwards. Not allocated by
    /// the dispatcher; kept for upstream compatibility.
    Proxy,
    /// Single-use worker created to serve one job, destroyed on release.
    Ephemeral,
    /// Long-lived worker pinned to a repository.
    Dedicated,
}

impl RunnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerType::Proxy => "proxy",
            RunnerType::Ephemeral => "ephemeral",
            RunnerType::Dedicated => "dedicated",
        }
    }

    pub fn requires_repository(&self) -> bool {
        matches!(self, RunnerType::Ephemeral | RunnerType::Dedicated)
    }
}

impl std::str::FromStr for RunnerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proxy" => Ok(RunnerType::Proxy),
            "ephemeral" => Ok(RunnerType::Ephemeral),
            "dedicated" => Ok(RunnerType::Dedicated),
            other => Err(format!("unknown runner type: {other}")),
        }
    }
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Starting,
    Idle,
    Busy,
    Offline,
    Stopping,
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::Starting => "starting",
            RunnerStatus::Idle => "idle",
            RunnerStatus::Busy => "busy",
            RunnerStatus::Offline => "offline",
            RunnerStatus::Stopping => "stopping",
        }
    }
}

impl std::str::FromStr for RunnerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(RunnerStatus::Starting),
            "idle" => Ok(RunnerStatus::Idle),
            "busy" => Ok(RunnerStatus::Busy),
            "offline" => Ok(RunnerStatus::Offline),
            "stopping" => Ok(RunnerStatus::Stopping),
            other => Err(format!("unknown runner status: {other}")),
        }
    }
}

/// A worker registered against the upstream that executes jobs.
///
/// EPHEMERAL runners serve at most one job, transition OFFLINE on release,
/// and are destroyed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct Runner {
    pub id: RunnerId,
    pub name: RunnerName,
    #[serde(rename = "type")]
    pub runner_type: RunnerType,
    /// Required for EPHEMERAL and DEDICATED runners
    pub repository: Option<Repository>,
    pub labels: BTreeSet<String>,
    pub status: RunnerStatus,
    pub container_id: Option<ContainerId>,
    /// Upstream-side runner id, once registration completed
    pub upstream_runner_id: Option<i64>,
    pub jobs_served: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Runner {
    /// A runner only counts as free when it is IDLE; callers additionally
    /// require the backing container to be RUNNING.
    pub fn is_idle(&self) -> bool {
        self.status == RunnerStatus::Idle
    }

    pub fn idle_since(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat.unwrap_or(self.created_at)
    }
}
