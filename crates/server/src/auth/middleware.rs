use crate::{
    auth::jwt::{UserIdentity, UserTokenService},
    error::{ErrorCode, ServerError},
};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

const ACCESS_TOKEN_QUERY_PARAM: &str = "access_token";

/// Identity of the caller, inserted as a request extension by [`require_bearer_auth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl From<UserIdentity> for AuthenticatedUser {
    fn from(identity: UserIdentity) -> Self {
        let display_name = identity.display_name();
        Self { user_id: identity.user_id, display_name, avatar_url: identity.picture }
    }
}

/// Accepts `Authorization: Bearer <token>`, or an `access_token` query
/// parameter for browser WebSocket upgrades that cannot set headers.
pub async fn require_bearer_auth(
    State(token_service): State<Arc<UserTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .map(ToOwned::to_owned)
        .or_else(|| request.uri().query().and_then(extract_query_token));

    let Some(token) = token else {
        return unauthorized_response("missing bearer token");
    };

    let identity = match token_service.validate_user_token(&token) {
        Ok(identity) => identity,
        Err(_) => return unauthorized_response("invalid bearer token"),
    };

    request.extensions_mut().insert(AuthenticatedUser::from(identity));

    next.run(request).await
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn extract_query_token(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == ACCESS_TOKEN_QUERY_PARAM)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(message: &'static str) -> Response {
    ServerError::new(ErrorCode::Unauthenticated, message).into_response()
}
