// Request validation at the HTTP and WebSocket edges.
//
// - `ValidatedJson<T>` extractor: content-type check + serde, rejected with the
//   JSON error envelope instead of axum's plain-text rejection.
// - Path id parsing and frame/body size limits.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::{ErrorCode, ServerError, ServiceError};

/// Maximum WebSocket text frame payload in bytes (16 KiB).
pub const MAX_WS_FRAME_BYTES: usize = 16 * 1024;

/// Maximum REST request body in bytes (64 KiB).
pub const MAX_REST_BODY_BYTES: usize = 64 * 1024;

/// A JSON body extractor that returns the structured error envelope on failure.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidatedJson(value)),
            Err(rejection) => {
                let (code, message, details) = classify_json_rejection(&rejection);
                Err(ServerError::new(code, message).with_details(details).into_response())
            }
        }
    }
}

fn classify_json_rejection(rejection: &JsonRejection) -> (ErrorCode, String, serde_json::Value) {
    match rejection {
        JsonRejection::JsonDataError(e) => (
            ErrorCode::InvalidArgument,
            format!("invalid JSON payload: {}", e.body_text()),
            serde_json::json!({ "kind": "data_error" }),
        ),
        JsonRejection::JsonSyntaxError(e) => (
            ErrorCode::InvalidArgument,
            format!("malformed JSON: {}", e.body_text()),
            serde_json::json!({ "kind": "syntax_error" }),
        ),
        JsonRejection::MissingJsonContentType(_) => (
            ErrorCode::InvalidArgument,
            "expected Content-Type: application/json".to_string(),
            serde_json::json!({ "kind": "missing_content_type" }),
        ),
        JsonRejection::BytesRejection(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => (
            ErrorCode::PayloadTooLarge,
            format!("request body exceeds limit of {MAX_REST_BODY_BYTES} bytes"),
            serde_json::json!({ "kind": "too_large", "limit": MAX_REST_BODY_BYTES }),
        ),
        other => (
            ErrorCode::InvalidArgument,
            format!("request body error: {}", other.body_text()),
            serde_json::json!({ "kind": "body_error" }),
        ),
    }
}

pub fn parse_stream_id(raw: &str) -> Result<Uuid, ServiceError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| ServiceError::InvalidArgument(format!("invalid stream id: {raw}")))
}

/// Returns the message sent back in an error frame when a frame is too big.
pub fn check_ws_frame_size(payload: &str) -> Result<(), String> {
    if payload.len() > MAX_WS_FRAME_BYTES {
        Err(format!(
            "frame size {} bytes exceeds limit of {} bytes",
            payload.len(),
            MAX_WS_FRAME_BYTES
        ))
    } else {
        Ok(())
    }
}
