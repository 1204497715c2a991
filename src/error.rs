//! Error types for the book generation service.
//!
//! - `RegistryError`: structural failures of the job registry (duplicate id,
//!   unknown id, illegal chapter transition, retry during a run).
//! - `LlmError`: failures of the text-generation backend. These are isolated
//!   to a single chapter and never abort a job.
//! - `ApiError`: what an HTTP handler returns; converts into a JSON
//!   `{ "error": .. }` response with a matching status code.

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;

use crate::models::ChapterStatus;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("job {id} already exists")]
    DuplicateJob { id: String },

    #[error("job {id} not found")]
    NotFound { id: String },

    #[error("job {id} has no chapter {index}")]
    ChapterOutOfRange { id: String, index: usize },

    #[error("job {id} is still generating")]
    RunInProgress { id: String },

    #[error("chapter {index} cannot {action} while {from:?}")]
    InvalidTransition {
        index: usize,
        from: ChapterStatus,
        action: &'static str,
    },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("failed to parse response: {0}")]
    ParseError(String),

    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("generation timed out after {0}s")]
    Timeout(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Registry(RegistryError::DuplicateJob { .. }) => StatusCode::CONFLICT,
            ApiError::Registry(RegistryError::InvalidTransition { .. })
            | ApiError::Registry(RegistryError::RunInProgress { .. }) => StatusCode::CONFLICT,
            ApiError::Registry(_) => StatusCode::NOT_FOUND,
            ApiError::Llm(LlmError::RateLimited { .. }) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Llm(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, status = status.as_u16(), "request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_errors_map_to_client_statuses() {
        let dup = ApiError::from(RegistryError::DuplicateJob { id: "b1".into() });
        assert_eq!(dup.status(), StatusCode::CONFLICT);

        let missing = ApiError::from(RegistryError::NotFound { id: "b1".into() });
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let range = ApiError::from(RegistryError::ChapterOutOfRange {
            id: "b1".into(),
            index: 9,
        });
        assert_eq!(range.status(), StatusCode::NOT_FOUND);

        let busy = ApiError::from(RegistryError::RunInProgress { id: "b1".into() });
        assert_eq!(busy.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn backend_errors_are_gateway_failures() {
        let err = ApiError::from(LlmError::ApiError {
            status: 500,
            message: "overloaded".into(),
        });
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ApiError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
