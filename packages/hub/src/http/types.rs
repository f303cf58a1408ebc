use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use runnerhub_types::ErrorCode;

pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Every API response carries this shape:
/// `{success, data?, error?, metadata: {timestamp, version}}`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    /// One of the error-taxonomy kinds
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResponseMetadata {
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
}

impl ResponseMetadata {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            version: API_VERSION,
        }
    }
}

/// 200 with the standard envelope.
pub fn ok<T: Serialize>(data: T) -> Response {
    with_status(StatusCode::OK, data)
}

pub fn with_status<T: Serialize>(status: StatusCode, data: T) -> Response {
    (
        status,
        Json(ApiResponse {
            success: status.is_success(),
            data: Some(data),
            error: None,
            metadata: ResponseMetadata::now(),
        }),
    )
        .into_response()
}

pub fn error_response(status: StatusCode, code: ErrorCode, message: String) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                code: code.as_str().to_string(),
                message,
            }),
            metadata: ResponseMetadata::now(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape() {
        let response = ApiResponse {
            success: true,
            data: Some(serde_json::json!({"x": 1})),
            error: None,
            metadata: ResponseMetadata::now(),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["data"]["x"], 1);
        assert!(value.get("error").is_none());
        assert!(value["metadata"]["timestamp"].is_string());
        assert_eq!(value["metadata"]["version"], API_VERSION);
    }
}
