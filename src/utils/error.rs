use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, warn};

use super::response::BaseResponse;

/// Crate-wide error type
///
/// Variants follow the failure taxonomy of the monitor: a log line that matches no
/// grammar is not an error at all (the classifier returns `None`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppError {
    /// Log file or SSH session cannot be reached
    #[error("source unavailable on {server}: {reason}")]
    SourceUnavailable { server: String, reason: String },

    /// Caller lacks the role for the requested action
    #[error("{0}")]
    AuthDenied(String),

    /// SSH host key did not match the pinned key
    #[error("host key verification failed for {server}: {reason}")]
    TrustViolation { server: String, reason: String },

    /// Remote or local command reported failure, or its output was unusable
    #[error("{0}")]
    ActionFailed(String),

    /// Notification could not be handed to the chat transport
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("{0}")]
    BadRequest(String),

    /// Request signature missing or invalid
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl AppError {
    pub fn source_unavailable(server: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::SourceUnavailable {
            server: server.into(),
            reason: reason.into(),
        }
    }

    pub fn trust_violation(server: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::TrustViolation {
            server: server.into(),
            reason: reason.into(),
        }
    }

    pub fn auth_denied(msg: impl Into<String>) -> Self {
        AppError::AuthDenied(msg.into())
    }

    pub fn action_failed(msg: impl Into<String>) -> Self {
        AppError::ActionFailed(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        AppError::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        AppError::Unauthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        AppError::InternalError(msg.into())
    }

    /// Error code reported to API callers
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::SourceUnavailable { .. } => "SOURCE503",
            AppError::AuthDenied(_) => "AUTH403",
            AppError::TrustViolation { .. } => "TRUST502",
            AppError::ActionFailed(_) => "ACTION502",
            AppError::DeliveryFailed(_) => "DELIVERY502",
            AppError::BadRequest(_) => "COMMON400",
            AppError::Unauthorized(_) => "AUTH401",
            AppError::NotFound(_) => "COMMON404",
            AppError::InternalError(_) => "COMMON500",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::SourceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::AuthDenied(_) => StatusCode::FORBIDDEN,
            AppError::TrustViolation { .. } => StatusCode::BAD_GATEWAY,
            AppError::ActionFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::DeliveryFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Trust violations must reach operators even when notifications are muted
    pub fn is_trust_violation(&self) -> bool {
        matches!(self, AppError::TrustViolation { .. })
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = BaseResponse::failure(&self);

        match &self {
            AppError::InternalError(_) => error!("Internal error: {}", body.message),
            _ => warn!(code = body.code, "Request rejected: {}", body.message),
        }

        (self.status_code(), Json(body)).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(format!("invalid request body: {}", rejection))
    }
}
