//! API error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use weft_workflow::{SignalError, WorkflowError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::NotFound(_) | WorkflowError::ExecutionNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            WorkflowError::AlreadyExists(_) | WorkflowError::NotRunning(_) => {
                ApiError::Conflict(err.to_string())
            }
            WorkflowError::InvalidDefinition(_)
            | WorkflowError::DagValidation(_)
            | WorkflowError::Signal(SignalError::Reserved(_))
            | WorkflowError::Signal(SignalError::EmptyKey) => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_status_mapping() {
        let cases = [
            (WorkflowError::ExecutionNotFound("e".into()), StatusCode::NOT_FOUND),
            (WorkflowError::NotFound("wf".into()), StatusCode::NOT_FOUND),
            (WorkflowError::NotRunning("e".into()), StatusCode::CONFLICT),
            (WorkflowError::AlreadyExists("e".into()), StatusCode::CONFLICT),
            (WorkflowError::InvalidDefinition("bad".into()), StatusCode::BAD_REQUEST),
            (WorkflowError::Signal(SignalError::EmptyKey), StatusCode::BAD_REQUEST),
            (WorkflowError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }
}
