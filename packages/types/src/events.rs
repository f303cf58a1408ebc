use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{
    ContainerId, ContainerState, JobId, JobStatus, Repository, RunnerId, ScalingEvent,
};

/// Events published on the in-process monitoring bus. Topics follow a
/// `<subject>.<verb>` naming scheme so subscribers can filter by prefix.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorEvent {
    JobQueued {
        job_id: JobId,
        repository: Repository,
    },
    JobAssigned {
        job_id: JobId,
        runner_id: RunnerId,
    },
    JobFinished {
        job_id: JobId,
        status: JobStatus,
    },
    RunnerCreated {
        runner_id: RunnerId,
        repository: Repository,
    },
    RunnerDestroyed {
        runner_id: RunnerId,
        repository: Repository,
    },
    ContainerState {
        container_id: ContainerId,
        state: ContainerState,
    },
    ContainerHighCpu {
        container_id: ContainerId,
        cpu_pct: f64,
    },
    ContainerHighMem {
        container_id: ContainerId,
        mem_pct: f64,
    },
    Scaling(ScalingEvent),
    NetworkCreated {
        repository: Repository,
        name: String,
    },
    NetworkRemoved {
        name: String,
    },
}

impl MonitorEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            MonitorEvent::JobQueued { .. } => "job.queued",
            MonitorEvent::JobAssigned { .. } => "job.assigned",
            MonitorEvent::JobFinished { .. } => "job.finished",
            MonitorEvent::RunnerCreated { .. } => "runner.created",
            MonitorEvent::RunnerDestroyed { .. } => "runner.destroyed",
            MonitorEvent::ContainerState { .. } => "container.state",
            MonitorEvent::ContainerHighCpu { .. } => "container.high_cpu",
            MonitorEvent::ContainerHighMem { .. } => "container.high_mem",
            MonitorEvent::Scaling(_) => "scaling.decision",
            MonitorEvent::NetworkCreated { .. } => "network.created",
            MonitorEvent::NetworkRemoved { .. } => "network.removed",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, ToSchema)]
pub struct JobCounts {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, ToSchema)]
pub struct RunnerCounts {
    pub total: u64,
    pub idle: u64,
    pub busy: u64,
    pub offline: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct PoolSnapshot {
    pub repository: Repository,
    pub utilization: f64,
    pub size: u32,
    pub in_cooldown: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, ToSchema)]
pub struct UpstreamSnapshot {
    pub remaining: Option<u64>,
    pub reset: Option<DateTime<Utc>>,
}

/// Point-in-time aggregate pushed to snapshot subscribers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub jobs: JobCounts,
    pub runners: RunnerCounts,
    pub pools: Vec<PoolSnapshot>,
    pub upstream: UpstreamSnapshot,
}

impl Snapshot {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            jobs: JobCounts::default(),
            runners: RunnerCounts::default(),
            pools: Vec::new(),
            upstream: UpstreamSnapshot::default(),
        }
    }
}
