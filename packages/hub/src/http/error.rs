use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use runnerhub_types::{Classify, ErrorCode};

use crate::dispatcher::DispatchError;
use crate::storage::{QueueError, StoreError};
use crate::subsystems::ingress::IngressError;
use crate::subsystems::lifecycle::LifecycleError;
use crate::subsystems::network::NetworkError;
use crate::subsystems::pool::PoolError;
use crate::subsystems::router::RouterError;
use crate::subsystems::scaler::ScalerError;

use super::types::error_response;

pub type HttpResult<T> = Result<T, HttpError>;

/// Edge error: an error-taxonomy kind plus a caller-safe message. Stack
/// detail stays in the logs.
#[derive(Error, Debug)]
#[error("{code}: {message}")]
pub struct HttpError {
    pub code: ErrorCode,
    pub message: String,
}

impl HttpError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    fn status(&self) -> StatusCode {
        match self.code {
            ErrorCode::Validation => StatusCode::BAD_REQUEST,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::StateError => StatusCode::CONFLICT,
            ErrorCode::Unrecoverable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.code, self.message)
    }
}

macro_rules! from_classified {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for HttpError {
                fn from(err: $err) -> Self {
                    HttpError {
                        code: err.code(),
                        message: err.to_string(),
                    }
                }
            }
        )*
    };
}

from_classified!(
    StoreError,
    QueueError,
    IngressError,
    LifecycleError,
    NetworkError,
    PoolError,
    RouterError,
    ScalerError,
    DispatchError,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_taxonomy() {
        let err: HttpError = StoreError::NotFound("job x".to_string()).into();
        assert_eq!(err.code, ErrorCode::NotFound);
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err: HttpError = StoreError::Conflict("dup".to_string()).into();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let err: HttpError = StoreError::Unavailable("down".to_string()).into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
