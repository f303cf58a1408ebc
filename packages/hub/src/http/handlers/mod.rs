pub mod containers;
pub mod health;
pub mod jobs;
pub mod networks;
pub mod openapi;
pub mod routing;
pub mod runners;
pub mod webhook;

use axum::http::StatusCode;
use axum::response::Response;

use runnerhub_types::ErrorCode;

use super::types::error_response;

pub async fn handle_not_found() -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        ErrorCode::NotFound,
        "no such route".to_string(),
    )
}
