//! HTTP error responses
//!
//! Every failure leaves the server as `{"code": <status>, "error": <message>}`
//! with the HTTP status equal to `code`.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use promptpal_core::models::ValidationError;
use promptpal_core::{ExecutionError, SessionError, SignatureError, StoreError};
use serde::Serialize;

/// Non-standard status for a request the client abandoned.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub code: u16,
    pub error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            code: status.as_u16(),
            error: error.into(),
        }
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    pub fn unauthorized(error: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, error)
    }

    pub fn not_found(error: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error)
    }

    pub fn internal(error: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error)
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<SignatureError> for ApiError {
    fn from(e: SignatureError) -> Self {
        ApiError::bad_request(e.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::TokenExpired
            | SessionError::TokenInvalidSignature
            | SessionError::TokenMalformed(_) => ApiError::unauthorized(e.to_string()),
            SessionError::WeakSecret
            | SessionError::Signing(_)
            | SessionError::TtlOutOfRange => {
                tracing::error!(error = %e, "session signing failed");
                ApiError::internal("failed to issue session")
            }
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::bad_request(e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ApiError::not_found(format!("{} not found", what)),
            StoreError::Conflict(msg) => ApiError::new(StatusCode::CONFLICT, msg),
            StoreError::Invalid(v) => v.into(),
            StoreError::Unavailable(inner) => {
                tracing::error!(error = %inner, "store unavailable");
                ApiError::internal("store unavailable")
            }
        }
    }
}

impl From<ExecutionError> for ApiError {
    fn from(e: ExecutionError) -> Self {
        let status = match e {
            ExecutionError::Store(inner) => return inner.into(),
            ExecutionError::PromptNotFound(_) | ExecutionError::ProjectNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ExecutionError::ProjectDisabled(_) => StatusCode::FORBIDDEN,
            ExecutionError::MissingVariable(_) | ExecutionError::InvalidTemplate(_) => {
                StatusCode::BAD_REQUEST
            }
            ExecutionError::ProviderTimeout => StatusCode::GATEWAY_TIMEOUT,
            ExecutionError::Provider { .. } => StatusCode::BAD_GATEWAY,
            ExecutionError::Cancelled => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
            }
        };
        ApiError::new(status, e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::new(e.status(), e.body_text())
    }
}
