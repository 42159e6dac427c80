//! Error classification shared by the webhook and control endpoints.

use crate::coordinator::CoordinatorError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Malformed or inconsistent payload. Never persisted, never retried.
    BadRequest,
    /// Event for a camp whose index is not loaded.
    StaleIndex,
    /// Unknown camp or activity schedule.
    NotFound,
    /// Engine load/unload failed or timed out.
    EngineUnavailable,
    /// Store failure; nothing was committed.
    Internal,
}

impl ErrorKind {
    /// Whether the sender may resend the same request unchanged.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::StaleIndex | Self::EngineUnavailable | Self::Internal
        )
    }

    pub fn status(self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::StaleIndex => StatusCode::CONFLICT,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::EngineUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error body embedded in API responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
        }
    }
}

/// Error returned by the control endpoints.
#[derive(Debug)]
pub struct ApiError(pub ErrorBody);

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        let kind = match err {
            CoordinatorError::EngineUnavailable { .. } => ErrorKind::EngineUnavailable,
            CoordinatorError::Stopped(_) => ErrorKind::Internal,
        };
        Self(ErrorBody::new(kind, err.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.kind.status();
        tracing::warn!(
            status = %status,
            kind = ?self.0.kind,
            message = %self.0.message,
            "request error"
        );
        (status, Json(self.0)).into_response()
    }
}
