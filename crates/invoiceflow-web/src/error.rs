//! Mapping of engine failures onto HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use invoiceflow_engine::EngineError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The request was well-formed JSON but made no sense.
    #[error("{0}")]
    Invalid(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Engine(e) => match e {
                EngineError::UnknownReview(_) | EngineError::InstanceNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                EngineError::AlreadyResolved(_)
                | EngineError::StateConflict { .. }
                | EngineError::AlreadyActive(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Short machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "INVALID_REQUEST",
            Self::Engine(e) => match e {
                EngineError::UnknownReview(_) => "UNKNOWN_REVIEW",
                EngineError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
                EngineError::AlreadyResolved(_) => "ALREADY_RESOLVED",
                EngineError::StateConflict { .. } => "STATE_CONFLICT",
                EngineError::AlreadyActive(_) => "ALREADY_ACTIVE",
                _ => "INTERNAL",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (
            status,
            Json(json!({ "error": self.to_string(), "code": self.code() })),
        )
            .into_response()
    }
}
