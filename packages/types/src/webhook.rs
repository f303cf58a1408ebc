use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use utoipa::ToSchema;

use crate::{JobPriority, Repository};

/// Persisted record of one webhook delivery. The raw payload is kept verbatim
/// so deliveries can be replayed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct WebhookEvent {
    pub delivery_id: String,
    pub event_type: String,
    pub action: Option<String>,
    pub repository: Option<Repository>,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    pub signature_verified: bool,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowJobAction {
    Queued,
    InProgress,
    Completed,
    Waiting,
}

impl WorkflowJobAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowJobAction::Queued => "queued",
            WorkflowJobAction::InProgress => "in_progress",
            WorkflowJobAction::Completed => "completed",
            WorkflowJobAction::Waiting => "waiting",
        }
    }
}

impl std::str::FromStr for WorkflowJobAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(WorkflowJobAction::Queued),
            "in_progress" => Ok(WorkflowJobAction::InProgress),
            "completed" => Ok(WorkflowJobAction::Completed),
            "waiting" => Ok(WorkflowJobAction::Waiting),
            other => Err(format!("unknown workflow_job action: {other}")),
        }
    }
}

/// The fields of a `workflow_job` payload the hub actually consumes. The rest
/// of the payload stays opaque on the persisted event.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct WorkflowJobFacts {
    pub upstream_job_id: i64,
    pub upstream_run_id: i64,
    pub workflow: String,
    pub labels: BTreeSet<String>,
    pub branch: Option<String>,
    pub conclusion: Option<String>,
}

/// Typed view of an incoming delivery. Tagged on the event-type header so
/// untyped JSON never crosses the ingress boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum UpstreamEvent {
    WorkflowJob {
        action: WorkflowJobAction,
        repository: Repository,
        facts: WorkflowJobFacts,
    },
    /// Persisted for audit; produces no dispatcher work
    Audit {
        event_type: String,
        action: Option<String>,
        repository: Option<Repository>,
    },
}

impl UpstreamEvent {
    /// Identifier of the entity the event is about, used in the dedup key.
    pub fn primary_entity_id(&self) -> String {
        match self {
            UpstreamEvent::WorkflowJob { facts, .. } => facts.upstream_job_id.to_string(),
            UpstreamEvent::Audit { .. } => String::new(),
        }
    }

    pub fn repository(&self) -> Option<&Repository> {
        match self {
            UpstreamEvent::WorkflowJob { repository, .. } => Some(repository),
            UpstreamEvent::Audit { repository, .. } => repository.as_ref(),
        }
    }
}

/// The message the ingress enqueues and dispatcher workers consume.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct DispatchPayload {
    pub delivery_id: String,
    pub event: String,
    pub action: WorkflowJobAction,
    pub repository: Repository,
    pub facts: WorkflowJobFacts,
}

impl DispatchPayload {
    /// Queue band derivation: deploy/hotfix workflows are CRITICAL, pull
    /// requests HIGH, pushes NORMAL, cleanup LOW.
    pub fn priority(&self) -> JobPriority {
        let workflow = self.facts.workflow.to_lowercase();
        if workflow.contains("deploy") || workflow.contains("hotfix") {
            JobPriority::Critical
        } else if self.facts.branch.as_deref().is_some_and(|b| {
            b.starts_with("pull/") || b.starts_with("pr/") || b.starts_with("refs/pull/")
        }) {
            JobPriority::High
        } else if workflow.contains("cleanup") || workflow.contains("nightly") {
            JobPriority::Low
        } else {
            JobPriority::Normal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(workflow: &str, branch: Option<&str>) -> DispatchPayload {
        DispatchPayload {
            delivery_id: "d1".to_string(),
            event: "workflow_job".to_string(),
            action: WorkflowJobAction::Queued,
            repository: Repository::new("org/repo1").unwrap(),
            facts: WorkflowJobFacts {
                upstream_job_id: 1,
                upstream_run_id: 2,
                workflow: workflow.to_string(),
                labels: BTreeSet::new(),
                branch: branch.map(str::to_string),
                conclusion: None,
            },
        }
    }

    #[test]
    fn priority_derivation() {
        assert_eq!(payload("Deploy prod", None).priority(), JobPriority::Critical);
        assert_eq!(payload("hotfix-rollout", None).priority(), JobPriority::Critical);
        assert_eq!(
            payload("ci", Some("refs/pull/42/merge")).priority(),
            JobPriority::High
        );
        assert_eq!(payload("nightly cleanup", None).priority(), JobPriority::Low);
        assert_eq!(payload("ci", Some("main")).priority(), JobPriority::Normal);
    }
}
