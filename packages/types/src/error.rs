use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// The error taxonomy surfaced at the API and queue edges. Subsystems keep
/// their own error enums; each maps into one of these kinds near the edge.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed input; never retried
    Validation,
    /// Optimistic-lock or uniqueness violation; retry with a fresh read
    Conflict,
    NotFound,
    /// Credential or signature failure
    Unauthorized,
    /// Upstream quota exhausted; back off until retry-after
    RateLimited,
    /// Network/5xx/IO timeout; retried with jitter, then dead-lettered
    Transient,
    /// Store/queue/runtime offline; fail fast
    Unavailable,
    /// Illegal state transition attempted
    StateError,
    /// Policy or contract violation; job fails loudly
    Unrecoverable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "validation_error",
            ErrorCode::Conflict => "conflict",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::Transient => "transient",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::StateError => "state_error",
            ErrorCode::Unrecoverable => "unrecoverable",
        }
    }

    /// Whether the dispatcher should nack-and-retry work failing with this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Transient | ErrorCode::RateLimited | ErrorCode::Conflict
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by subsystem errors so the edges can derive an `ErrorCode`
/// without matching on foreign enums.
pub trait Classify {
    fn code(&self) -> ErrorCode;
}
