use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use utoipa::{IntoParams, ToSchema};

use runnerhub_types::{
    PoolMetrics, PoolPolicy, Repository, RunnerPool, RunnerStatus, RunnerType, ScaleDirection,
    ScalingEvent,
};

use crate::http::error::{HttpError, HttpResult};
use crate::http::state::HttpState;
use crate::http::types::ok;

#[derive(Debug, Deserialize, IntoParams)]
pub struct RunnerListQuery {
    /// proxy|ephemeral|dedicated
    #[serde(rename = "type")]
    pub runner_type: Option<String>,
    /// starting|idle|busy|offline|stopping
    pub status: Option<String>,
    pub repository: Option<String>,
}

#[utoipa::path(
    get,
    path = "/runners",
    params(RunnerListQuery),
    responses((status = 200, description = "Runners matching the filters"))
)]
pub async fn handle_list_runners(
    State(state): State<HttpState>,
    Query(query): Query<RunnerListQuery>,
) -> HttpResult<Response> {
    let repository = query
        .repository
        .as_deref()
        .map(Repository::new)
        .transpose()
        .map_err(|e| HttpError::validation(e.to_string()))?;
    let status = query
        .status
        .as_deref()
        .map(RunnerStatus::from_str)
        .transpose()
        .map_err(HttpError::validation)?;
    let runner_type = query
        .runner_type
        .as_deref()
        .map(RunnerType::from_str)
        .transpose()
        .map_err(HttpError::validation)?;

    let runners = state
        .dispatcher
        .store
        .list_runners(repository.as_ref(), status, runner_type)
        .await?;
    Ok(ok(runners))
}

#[derive(Serialize, ToSchema)]
pub struct PoolView {
    #[serde(flatten)]
    pub pool: RunnerPool,
    pub metrics: PoolMetrics,
    pub in_cooldown: bool,
}

#[utoipa::path(
    get,
    path = "/runners/pools",
    responses((status = 200, description = "Pool configs with live metrics"))
)]
pub async fn handle_list_pools(State(state): State<HttpState>) -> HttpResult<Response> {
    let pools = state.dispatcher.store.list_pools().await?;
    let mut views = Vec::with_capacity(pools.len());
    for pool in pools {
        let metrics = state.dispatcher.pool.metrics(&pool.repository).await?;
        let in_cooldown = state
            .dispatcher
            .scaler
            .in_cooldown(&pool.repository, pool.policy.cooldown_s);
        views.push(PoolView {
            pool,
            metrics,
            in_cooldown,
        });
    }
    Ok(ok(views))
}

fn repo_from_path(owner: &str, name: &str) -> Result<Repository, HttpError> {
    Repository::new(format!("{owner}/{name}")).map_err(|e| HttpError::validation(e.to_string()))
}

#[utoipa::path(
    get,
    path = "/runners/pools/{owner}/{repo}",
    params(
        ("owner" = String, Path, description = "Repository owner"),
        ("repo" = String, Path, description = "Repository name")
    ),
    responses(
        (status = 200, description = "Pool config and metrics"),
        (status = 404, description = "No pool for this repository")
    )
)]
pub async fn handle_get_pool(
    State(state): State<HttpState>,
    Path((owner, name)): Path<(String, String)>,
) -> HttpResult<Response> {
    let repository = repo_from_path(&owner, &name)?;
    let pool = state
        .dispatcher
        .store
        .get_pool(&repository)
        .await?
        .ok_or_else(|| HttpError::not_found(format!("no pool for {repository}")))?;
    let metrics = state.dispatcher.pool.metrics(&repository).await?;
    let in_cooldown = state
        .dispatcher
        .scaler
        .in_cooldown(&repository, pool.policy.cooldown_s);
    Ok(ok(PoolView {
        pool,
        metrics,
        in_cooldown,
    }))
}

#[utoipa::path(
    put,
    path = "/runners/pools/{owner}/{repo}",
    params(
        ("owner" = String, Path, description = "Repository owner"),
        ("repo" = String, Path, description = "Repository name")
    ),
    request_body = PoolPolicy,
    responses(
        (status = 200, description = "Policy updated"),
        (status = 400, description = "Policy fails validation")
    )
)]
pub async fn handle_update_pool(
    State(state): State<HttpState>,
    Path((owner, name)): Path<(String, String)>,
    Json(policy): Json<PoolPolicy>,
) -> HttpResult<Response> {
    policy.validate().map_err(HttpError::validation)?;
    let repository = repo_from_path(&owner, &name)?;
    let pool = state
        .dispatcher
        .pool
        .update_policy(&repository, policy)
        .await?;
    Ok(ok(pool))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ScaleRequest {
    /// up|down
    pub action: String,
    pub count: Option<u32>,
}

#[derive(Serialize, ToSchema)]
pub struct ScaleResponse {
    #[serde(flatten)]
    pub event: ScalingEvent,
}

#[utoipa::path(
    post,
    path = "/runners/pools/{owner}/{repo}/scale",
    params(
        ("owner" = String, Path, description = "Repository owner"),
        ("repo" = String, Path, description = "Repository name")
    ),
    request_body = ScaleRequest,
    responses(
        (status = 200, description = "Forced scaling applied"),
        (status = 400, description = "Unknown action")
    )
)]
pub async fn handle_scale_pool(
    State(state): State<HttpState>,
    Path((owner, name)): Path<(String, String)>,
    Json(request): Json<ScaleRequest>,
) -> HttpResult<Response> {
    let repository = repo_from_path(&owner, &name)?;
    let direction = match request.action.as_str() {
        "up" => ScaleDirection::Up,
        "down" => ScaleDirection::Down,
        other => {
            return Err(HttpError::validation(format!(
                "action must be `up` or `down`, got `{other}`"
            )))
        }
    };
    let event = state
        .dispatcher
        .scaler
        .force(&repository, direction, request.count.unwrap_or(1))
        .await?;
    Ok(ok(ScaleResponse { event }))
}
