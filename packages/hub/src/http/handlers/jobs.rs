use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::str::FromStr;
use utoipa::{IntoParams, ToSchema};

use runnerhub_types::{JobId, JobStatus, Repository};

use crate::http::error::{HttpError, HttpResult};
use crate::http::state::HttpState;
use crate::http::types::ok;
use crate::storage::JobFilter;

#[derive(Debug, Deserialize, IntoParams)]
pub struct JobListQuery {
    /// queued|assigned|running|completed|failed|cancelled
    pub status: Option<String>,
    /// `owner/name`
    pub repository: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[utoipa::path(
    get,
    path = "/jobs",
    params(JobListQuery),
    responses((status = 200, description = "Jobs matching the filters"))
)]
pub async fn handle_list_jobs(
    State(state): State<HttpState>,
    Query(query): Query<JobListQuery>,
) -> HttpResult<Response> {
    let filter = JobFilter {
        status: query
            .status
            .as_deref()
            .map(JobStatus::from_str)
            .transpose()
            .map_err(HttpError::validation)?,
        repository: query
            .repository
            .as_deref()
            .map(Repository::new)
            .transpose()
            .map_err(|e| HttpError::validation(e.to_string()))?,
        since: query.since,
        until: query.until,
        limit: query.limit.unwrap_or(100).clamp(1, 1000),
        offset: query.offset.unwrap_or(0),
    };

    let jobs = state.dispatcher.store.list_jobs(&filter).await?;
    Ok(ok(jobs))
}

#[utoipa::path(
    get,
    path = "/jobs/{id}",
    params(("id" = String, Path, description = "Job id")),
    responses(
        (status = 200, description = "The job"),
        (status = 404, description = "Unknown job")
    )
)]
pub async fn handle_get_job(
    State(state): State<HttpState>,
    Path(id): Path<String>,
) -> HttpResult<Response> {
    let id = JobId::from_str(&id).map_err(|e| HttpError::validation(e.to_string()))?;
    let job = state.dispatcher.store.get_job(id).await?;
    Ok(ok(job))
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CancelRequest {
    /// Grace period for stopping an assigned container
    pub grace_s: Option<u64>,
}

#[utoipa::path(
    post,
    path = "/jobs/{id}/cancel",
    params(("id" = String, Path, description = "Job id")),
    request_body = CancelRequest,
    responses(
        (status = 200, description = "Job cancelled"),
        (status = 409, description = "Job already terminal")
    )
)]
pub async fn handle_cancel_job(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> HttpResult<Response> {
    let id = JobId::from_str(&id).map_err(|e| HttpError::validation(e.to_string()))?;
    let grace_s = body.and_then(|b| b.grace_s).unwrap_or(30);
    let job = state.dispatcher.cancel_job(id, grace_s).await?;
    Ok(ok(job))
}
