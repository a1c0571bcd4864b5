//! API error type.
//!
//! Every failed request answers `{"success": false, "message": ..}`, plus the
//! failure `kind` when the error comes from the orchestration core.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cascade::errors::CascadeError;
use serde_json::json;
use thiserror::Error;

/// Errors returned by the HTTP handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Error raised by the orchestration core
    #[error(transparent)]
    Cascade(#[from] CascadeError),

    /// Malformed request body or query
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The feature needs configuration that is missing
    #[error("Not configured: {0}")]
    NotConfigured(String),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Cascade(CascadeError::EntityBusy(_)) => StatusCode::CONFLICT,
            Self::Cascade(CascadeError::UnknownStage(_)) => StatusCode::NOT_FOUND,
            Self::Cascade(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            Self::Cascade(CascadeError::DependencyUnavailable(_)) | Self::NotConfigured(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Cascade(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let mut body = json!({
            "success": false,
            "message": self.to_string(),
        });
        if let (Self::Cascade(e), Some(map)) = (&self, body.as_object_mut()) {
            if let Some(kind) = e.to_dict().remove("kind") {
                map.insert("kind".to_string(), kind);
            }
        }

        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

/// Result type alias using `ApiError`.
pub type ApiResult<T> = Result<T, ApiError>;
