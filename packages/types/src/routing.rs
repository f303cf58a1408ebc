use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use utoipa::ToSchema;

use crate::{JobId, Repository, RuleId, RunnerId};

/// Conditions a job must satisfy for a rule to match. All present conditions
/// must hold; absent conditions always hold.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, ToSchema)]
pub struct RuleConditions {
    /// Labels the job must carry (subset check against the job's labels)
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<String>,
    /// Glob over `owner/name`; `*` does not cross `/`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_pattern: Option<String>,
    /// Webhook event that produced the job (e.g. `workflow_job`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

/// Where matched jobs are sent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct RuleTargets {
    /// Candidate runners must carry these labels (superset; equality when
    /// `exclusive` is set)
    pub runner_labels: BTreeSet<String>,
    /// Restrict candidates to a specific repository pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_override: Option<Repository>,
    /// Candidate label set must equal `runner_labels` exactly
    #[serde(default)]
    pub exclusive: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct RoutingRule {
    pub id: RuleId,
    pub name: String,
    /// Higher priority rules are evaluated first
    pub priority: i32,
    pub conditions: RuleConditions,
    pub targets: RuleTargets,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only record of one routing evaluation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct RoutingDecision {
    pub job_id: JobId,
    pub matched_rule_id: Option<RuleId>,
    pub selected_runner_id: Option<RunnerId>,
    pub candidate_count: u32,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}
