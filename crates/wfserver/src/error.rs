use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use std::fmt;
use wfcore::{DefinitionError, EngineError};

/// Error body returned by every endpoint
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}

/// Engine errors mapped onto HTTP status codes.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        Self(error)
    }
}

impl From<DefinitionError> for ApiError {
    fn from(error: DefinitionError) -> Self {
        Self(EngineError::Definition(error))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match &self.0 {
            EngineError::Definition(DefinitionError::NotFound(_)) => "workflow_not_found",
            EngineError::Definition(_) => "definition",
            EngineError::ExecutionNotFound(_) => "execution_not_found",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::InvalidResponse(_) => "invalid_response",
            EngineError::Executor { .. } => "executor",
            EngineError::LoopLimitExceeded { .. } => "loop_limit_exceeded",
            EngineError::Cancellation { .. } => "cancellation",
            EngineError::Io(_) | EngineError::Serialization(_) => "internal",
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            EngineError::Definition(DefinitionError::NotFound(_))
            | EngineError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Definition(_) | EngineError::InvalidResponse(_) => StatusCode::BAD_REQUEST,
            EngineError::InvalidState { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.status_code().is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.0.to_string(),
            kind: self.kind(),
        })
    }
}
