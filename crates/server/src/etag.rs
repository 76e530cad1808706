// Version ETags and If-Match extraction for conditional stream writes.
//
// A stream's ETag is its session version: `"v{version}"`.

use axum::{
    extract::FromRequestParts,
    http::{header::IF_MATCH, request::Parts},
    response::{IntoResponse, Response},
};

use crate::error::{ErrorCode, ServerError, ServiceError};

/// Raw `If-Match` header value. A missing header is rejected with 428.
#[derive(Debug, Clone)]
pub struct IfMatchHeader(pub String);

impl<S> FromRequestParts<S> for IfMatchHeader
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(IF_MATCH)
            .ok_or_else(|| ServerError::from_code(ErrorCode::PreconditionRequired).into_response())?
            .to_str()
            .map_err(|_| {
                ServerError::new(ErrorCode::InvalidArgument, "If-Match header is not valid utf-8")
                    .into_response()
            })?
            .to_owned();

        Ok(IfMatchHeader(value))
    }
}

impl IfMatchHeader {
    /// Version the caller expects to overwrite. `*` means any version.
    ///
    /// A value that is not a stream ETag can never match, so it is reported
    /// as a conflict like any stale version.
    pub fn expected_version(&self) -> Result<Option<i64>, ServiceError> {
        if self.0.trim() == "*" {
            return Ok(None);
        }
        parse_stream_etag(&self.0).map(Some).ok_or(ServiceError::Conflict)
    }
}

pub fn stream_etag(version: i64) -> String {
    format!("\"v{version}\"")
}

pub fn parse_stream_etag(value: &str) -> Option<i64> {
    normalize_etag(value).strip_prefix('v')?.parse().ok()
}

/// Strip optional `W/` prefix and surrounding quotes from an etag value.
pub fn normalize_etag(value: &str) -> &str {
    let trimmed = value.trim();
    let without_weak = trimmed.strip_prefix("W/").unwrap_or(trimmed);
    without_weak.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(without_weak)
}
