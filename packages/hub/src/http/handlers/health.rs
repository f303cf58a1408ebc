use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::http::state::HttpState;
use crate::http::types::with_status;

#[derive(Serialize, ToSchema)]
pub struct HealthBody {
    pub status: &'static str,
    pub store: bool,
    pub queue: bool,
    pub queue_depth: u64,
    pub dead_letters: u64,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Liveness plus store/queue status"),
        (status = 503, description = "Draining or a dependency is down")
    )
)]
pub async fn handle_health(State(state): State<HttpState>) -> Response {
    if state.draining() {
        return with_status(
            StatusCode::SERVICE_UNAVAILABLE,
            HealthBody {
                status: "draining",
                store: false,
                queue: false,
                queue_depth: 0,
                dead_letters: 0,
            },
        );
    }

    let store_ok = state.dispatcher.store.ping().await.is_ok();
    let queue_ok = state.dispatcher.queue.ping().await.is_ok();
    let queue_depth = state.dispatcher.queue.depth(None).await.unwrap_or(0);
    let dead_letters = state.dispatcher.queue.dead_count().await.unwrap_or(0);

    let (status, label) = if store_ok && queue_ok {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    with_status(
        status,
        HealthBody {
            status: label,
            store: store_ok,
            queue: queue_ok,
            queue_depth,
            dead_letters,
        },
    )
    .into_response()
}
