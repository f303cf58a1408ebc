use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use utoipa::ToSchema;

use runnerhub_types::{
    Job, JobId, JobPriority, JobStatus, Repository, RoutingRule, RuleConditions, RuleId,
    RuleTargets, RunnerId,
};

use crate::http::error::{HttpError, HttpResult};
use crate::http::state::HttpState;
use crate::http::types::{ok, with_status};

#[utoipa::path(
    get,
    path = "/routing/rules",
    responses((status = 200, description = "All routing rules, priority descending"))
)]
pub async fn handle_list_rules(State(state): State<HttpState>) -> HttpResult<Response> {
    let rules = state.dispatcher.store.list_rules(false).await?;
    Ok(ok(rules))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RuleRequest {
    pub id: RuleId,
    pub name: String,
    pub priority: i32,
    #[serde(default)]
    pub conditions: RuleConditions,
    pub targets: RuleTargets,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RuleRequest {
    fn into_rule(self) -> RoutingRule {
        let now = Utc::now();
        RoutingRule {
            id: self.id,
            name: self.name,
            priority: self.priority,
            conditions: self.conditions,
            targets: self.targets,
            enabled: self.enabled,
            created_at: now,
            updated_at: now,
        }
    }
}

#[utoipa::path(
    post,
    path = "/routing/rules",
    request_body = RuleRequest,
    responses(
        (status = 201, description = "Rule created"),
        (status = 409, description = "Rule id already exists")
    )
)]
pub async fn handle_create_rule(
    State(state): State<HttpState>,
    Json(request): Json<RuleRequest>,
) -> HttpResult<Response> {
    if request.targets.runner_labels.is_empty() {
        return Err(HttpError::validation("targets.runner_labels must not be empty"));
    }
    let rule = request.into_rule();
    state.dispatcher.store.insert_rule(&rule).await?;
    state.dispatcher.router.reload().await?;
    Ok(with_status(StatusCode::CREATED, rule))
}

#[utoipa::path(
    put,
    path = "/routing/rules/{id}",
    params(("id" = String, Path, description = "Rule id")),
    request_body = RuleRequest,
    responses(
        (status = 200, description = "Rule updated"),
        (status = 404, description = "Unknown rule")
    )
)]
pub async fn handle_update_rule(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    Json(request): Json<RuleRequest>,
) -> HttpResult<Response> {
    let id = RuleId::new(id).map_err(|e| HttpError::validation(e.to_string()))?;
    if request.id != id {
        return Err(HttpError::validation("rule id in path and body differ"));
    }
    let mut rule = request.into_rule();
    rule.updated_at = Utc::now();
    state.dispatcher.store.update_rule(&rule).await?;
    state.dispatcher.router.reload().await?;
    Ok(ok(rule))
}

#[utoipa::path(
    delete,
    path = "/routing/rules/{id}",
    params(("id" = String, Path, description = "Rule id")),
    responses(
        (status = 200, description = "Rule deleted"),
        (status = 404, description = "Unknown rule")
    )
)]
pub async fn handle_delete_rule(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> HttpResult<Response> {
    let id = RuleId::new(id).map_err(|e| HttpError::validation(e.to_string()))?;
    state.dispatcher.store.delete_rule(&id).await?;
    state.dispatcher.router.reload().await?;
    Ok(ok(serde_json::json!({"deleted": id.to_string()})))
}

/// A synthetic job for dry-run routing.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PreviewRequest {
    pub repository: Repository,
    #[serde(default)]
    pub workflow: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub branch: Option<String>,
    #[serde(default = "default_event")]
    pub event: String,
}

fn default_event() -> String {
    "workflow_job".to_string()
}

#[derive(Serialize, ToSchema)]
pub struct PreviewResponse {
    pub matches: bool,
    pub matched_rule_id: Option<String>,
    pub exclusive: bool,
    pub candidates: Vec<RunnerId>,
    pub selected_runner_id: Option<RunnerId>,
    pub reason: String,
}

#[utoipa::path(
    post,
    path = "/routing/preview",
    request_body = PreviewRequest,
    responses((status = 200, description = "Dry-run routing decision", body = PreviewResponse))
)]
pub async fn handle_preview(
    State(state): State<HttpState>,
    Json(request): Json<PreviewRequest>,
) -> HttpResult<Response> {
    let job = Job {
        id: JobId::generate(),
        upstream_job_id: 0,
        upstream_run_id: 0,
        repository: request.repository,
        workflow: request.workflow,
        labels: request.labels,
        priority: JobPriority::Normal,
        status: JobStatus::Queued,
        assigned_runner_id: None,
        container_id: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        error: None,
    };

    let outcome = state
        .dispatcher
        .router
        .preview(&job, request.branch.as_deref(), &request.event)
        .await?;

    Ok(ok(PreviewResponse {
        matches: outcome.matched_rule.is_some(),
        matched_rule_id: outcome.matched_rule.as_ref().map(|r| r.id.to_string()),
        exclusive: outcome.exclusive(),
        candidates: outcome.candidates.iter().map(|r| r.id).collect(),
        selected_runner_id: outcome.selected.as_ref().map(|r| r.id),
        reason: outcome.reason,
    }))
}
