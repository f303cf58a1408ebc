use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::http::error::HttpResult;
use crate::http::state::HttpState;
use crate::http::types::ok;
use crate::subsystems::ingress::{IngressError, IngressOutcome, RawDelivery};

/// The webhook endpoint answers with this minimal shape, not the standard
/// envelope; the upstream only looks at the status code.
#[derive(Serialize, ToSchema)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub delivery_id: String,
}

#[utoipa::path(
    post,
    path = "/webhooks/github",
    request_body(content = String, description = "Raw GitHub webhook payload", content_type = "application/octet-stream"),
    responses(
        (status = 202, description = "Delivery verified and accepted", body = WebhookResponse),
        (status = 200, description = "Duplicate delivery", body = WebhookResponse),
        (status = 400, description = "Missing required headers"),
        (status = 401, description = "Signature verification failed")
    )
)]
pub async fn handle_webhook(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };

    // the upstream always sends its hookshot marker; anything else is not a
    // webhook delivery
    let user_agent = header("user-agent");
    if !user_agent.starts_with("GitHub-Hookshot/") {
        return (StatusCode::BAD_REQUEST, "missing user agent marker").into_response();
    }

    let delivery = RawDelivery {
        event_type: header("x-github-event"),
        delivery_id: header("x-github-delivery"),
        signature: header("x-hub-signature-256"),
        body: body.to_vec(),
    };

    match state.dispatcher.ingress.process(delivery).await {
        Ok(IngressOutcome::Accepted { delivery_id, .. }) => (
            StatusCode::ACCEPTED,
            Json(WebhookResponse {
                status: "accepted",
                delivery_id,
            }),
        )
            .into_response(),
        Ok(IngressOutcome::Duplicate { delivery_id }) => (
            StatusCode::OK,
            Json(WebhookResponse {
                status: "duplicate",
                delivery_id,
            }),
        )
            .into_response(),
        Err(IngressError::MissingHeader(name)) => {
            (StatusCode::BAD_REQUEST, format!("missing header: {name}")).into_response()
        }
        Err(IngressError::BadSignature) => {
            (StatusCode::UNAUTHORIZED, "signature mismatch").into_response()
        }
        Err(IngressError::MalformedPayload(reason)) => {
            (StatusCode::BAD_REQUEST, reason).into_response()
        }
        Err(err) => {
            // persist/queue trouble after verification; the upstream will
            // redeliver
            tracing::error!("Webhook processing failed: {}", err);
            (StatusCode::SERVICE_UNAVAILABLE, "try again").into_response()
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ReplayResponse {
    pub delivery_id: String,
    pub enqueued: bool,
}

#[utoipa::path(
    post,
    path = "/webhooks/replay/{delivery_id}",
    params(("delivery_id" = String, Path, description = "Delivery to re-enqueue")),
    responses(
        (status = 200, description = "Replayed, bypassing dedup"),
        (status = 404, description = "Unknown delivery id")
    )
)]
pub async fn handle_replay(
    State(state): State<HttpState>,
    Path(delivery_id): Path<String>,
) -> HttpResult<Response> {
    let enqueued = state.dispatcher.ingress.replay(&delivery_id).await?;
    Ok(ok(ReplayResponse {
        delivery_id,
        enqueued,
    }))
}

#[derive(Serialize, ToSchema)]
pub struct RetryFailedResponse {
    pub retried: u32,
}

#[utoipa::path(
    post,
    path = "/webhooks/retry-failed",
    responses((status = 200, description = "Failed deliveries re-enqueued, up to the cap"))
)]
pub async fn handle_retry_failed(State(state): State<HttpState>) -> HttpResult<Response> {
    let retried = state.dispatcher.ingress.retry_failed().await?;
    Ok(ok(RetryFailedResponse { retried }))
}
