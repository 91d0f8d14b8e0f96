//! HTTP error mapping.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::sandbox::ExecError;
use crate::tracker::JiraError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Jira(#[from] JiraError),

    /// The request body is malformed or fails validation.
    #[error("{0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Exec(e) => match e {
                ExecError::PathTraversal { .. } | ExecError::InvalidParameter { .. } => {
                    StatusCode::BAD_REQUEST
                }
                ExecError::ExecutableNotFound { .. } => StatusCode::NOT_FOUND,
                ExecError::Spawn { .. }
                | ExecError::ToolFailed { .. }
                | ExecError::InvalidJsonOutput { .. } => StatusCode::BAD_GATEWAY,
                ExecError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Jira(e) if e.is_config() => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Jira(_) => StatusCode::BAD_GATEWAY,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Exec(e) => match e {
                ExecError::PathTraversal { .. } => "path_traversal",
                ExecError::ExecutableNotFound { .. } => "executable_not_found",
                ExecError::InvalidParameter { .. } => "invalid_parameter",
                ExecError::Spawn { .. } => "spawn_failed",
                ExecError::ToolFailed { .. } => "tool_failed",
                ExecError::InvalidJsonOutput { .. } => "invalid_json_output",
                ExecError::Io(_) => "internal_error",
            },
            Self::Jira(e) if e.is_config() => "config_error",
            Self::Jira(_) => "upstream_error",
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Structured context for failures the caller can act on.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::Exec(ExecError::ToolFailed {
                exit_code,
                timed_out,
                stdout,
                stderr,
            }) => {
                let mut details = json!({
                    "exit_code": exit_code,
                    "timed_out": timed_out,
                    "stderr": stderr,
                });
                if !stdout.is_empty() {
                    details["stdout"] = json!(stdout);
                }
                Some(details)
            }
            Self::Exec(ExecError::InvalidJsonOutput {
                exit_code,
                timed_out,
                stdout,
                stderr,
                ..
            }) => Some(json!({
                "exit_code": exit_code,
                "timed_out": timed_out,
                "stdout": stdout,
                "stderr": stderr,
            })),
            Self::Exec(ExecError::InvalidParameter { name, .. }) => {
                Some(json!({ "parameter": name }))
            }
            Self::Jira(JiraError::Api { action, status, .. }) => {
                Some(json!({ "action": action, "status": status }))
            }
            _ => None,
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
                details: self.details(),
            },
        };
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(error: tokio::task::JoinError) -> Self {
        Self::Internal(format!("execution task failed: {error}"))
    }
}
