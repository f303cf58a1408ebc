use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use std::str::FromStr;
use utoipa::{IntoParams, ToSchema};

use runnerhub_types::{ContainerId, ContainerState, Repository};

use crate::http::error::{HttpError, HttpResult};
use crate::http::state::HttpState;
use crate::http::types::ok;

#[derive(Debug, Deserialize, IntoParams)]
pub struct ContainerListQuery {
    /// creating|created|starting|running|stopping|stopped|removing|removed|error
    pub state: Option<String>,
    pub repository: Option<String>,
}

#[utoipa::path(
    get,
    path = "/containers",
    params(ContainerListQuery),
    responses((status = 200, description = "Container records matching the filters"))
)]
pub async fn handle_list_containers(
    State(state): State<HttpState>,
    Query(query): Query<ContainerListQuery>,
) -> HttpResult<Response> {
    let container_state = query
        .state
        .as_deref()
        .map(ContainerState::from_str)
        .transpose()
        .map_err(HttpError::validation)?;
    let repository = query
        .repository
        .as_deref()
        .map(Repository::new)
        .transpose()
        .map_err(|e| HttpError::validation(e.to_string()))?;

    let containers = state
        .dispatcher
        .store
        .list_containers(container_state, repository.as_ref())
        .await?;
    Ok(ok(containers))
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct StopRequest {
    pub grace_s: Option<u64>,
}

#[utoipa::path(
    post,
    path = "/containers/{id}/stop",
    params(("id" = String, Path, description = "Container id")),
    request_body = StopRequest,
    responses(
        (status = 200, description = "Container stopped"),
        (status = 404, description = "Unknown container"),
        (status = 409, description = "Container is not in a stoppable state")
    )
)]
pub async fn handle_stop_container(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    body: Option<Json<StopRequest>>,
) -> HttpResult<Response> {
    let id = ContainerId::new(id);
    let grace_s = body.and_then(|b| b.grace_s);
    state.dispatcher.lifecycle.stop(&id, grace_s).await?;
    let record = state.dispatcher.store.get_container(&id).await?;
    Ok(ok(record))
}
