use axum::extract::State;
use axum::response::Response;
use serde::Serialize;
use utoipa::ToSchema;

use crate::http::error::HttpResult;
use crate::http::state::HttpState;
use crate::http::types::ok;

#[utoipa::path(
    get,
    path = "/networks",
    responses((status = 200, description = "Active isolation networks"))
)]
pub async fn handle_list_networks(State(state): State<HttpState>) -> HttpResult<Response> {
    let networks = state.dispatcher.store.active_networks().await?;
    Ok(ok(networks))
}

#[derive(Serialize, ToSchema)]
pub struct CleanupResponse {
    pub removed: u32,
}

#[utoipa::path(
    post,
    path = "/networks/cleanup",
    responses((status = 200, description = "Reaper pass completed", body = CleanupResponse))
)]
pub async fn handle_network_cleanup(State(state): State<HttpState>) -> HttpResult<Response> {
    let removed = state.dispatcher.network.reap().await?;
    Ok(ok(CleanupResponse { removed }))
}
