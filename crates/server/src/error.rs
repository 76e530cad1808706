use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use scrolllive_common::validation::ValidationError;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unauthenticated,
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    PermissionDenied,
    PreconditionRequired,
    Aborted,
    PayloadTooLarge,
    Unavailable,
    Internal,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::NotFound => "NOT_FOUND",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::PreconditionRequired => "PRECONDITION_REQUIRED",
            Self::Aborted => "ABORTED",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::Unavailable => "UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::InvalidArgument => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
            Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::PreconditionRequired => StatusCode::PRECONDITION_REQUIRED,
            Self::Aborted => StatusCode::CONFLICT,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::Aborted | Self::Unavailable | Self::Internal)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::Unauthenticated => "invalid authentication token",
            Self::InvalidArgument => "request validation failed",
            Self::NotFound => "requested resource not found",
            Self::FailedPrecondition => "stream is not in the required state",
            Self::PermissionDenied => "caller lacks required permission",
            Self::PreconditionRequired => "missing required precondition header",
            Self::Aborted => "resource was modified concurrently",
            Self::PayloadTooLarge => "payload exceeds maximum allowed size",
            Self::Unavailable => "media service is unavailable",
            Self::Internal => "internal server error",
        }
    }
}

/// JSON error envelope returned by every HTTP route.
#[derive(Debug, Clone)]
pub struct ServerError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl ServerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

/// Failures raised by the stream coordination operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    FailedPrecondition(&'static str),
    #[error("{0}")]
    PermissionDenied(&'static str),
    #[error("stream was modified concurrently")]
    Conflict,
    #[error("media service unavailable")]
    MediaUnavailable(#[source] anyhow::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<sqlx::Error> for ServiceError {
    fn from(error: sqlx::Error) -> Self {
        Self::Internal(anyhow::Error::new(error).context("stream store query failed"))
    }
}

impl ServiceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) | Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::Conflict => ErrorCode::Aborted,
            Self::MediaUnavailable(_) => ErrorCode::Unavailable,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Message safe to show to the caller; infrastructure causes stay server side.
    pub fn public_message(&self) -> String {
        match self {
            Self::MediaUnavailable(_) | Self::Internal(_) => {
                self.code().default_message().to_string()
            }
            other => other.to_string(),
        }
    }

    /// Log causes the caller will not see.
    pub fn log(&self) {
        match self {
            Self::MediaUnavailable(error) => {
                tracing::warn!(error = ?error, "media service call failed");
            }
            Self::Internal(error) => {
                tracing::error!(error = ?error, "stream service internal error");
            }
            _ => {}
        }
    }
}

impl From<ServiceError> for ServerError {
    fn from(error: ServiceError) -> Self {
        error.log();
        ServerError::new(error.code(), error.public_message())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        ServerError::from(self).into_response()
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
