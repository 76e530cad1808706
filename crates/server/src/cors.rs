// CORS for the browser client.
//
// Allowed origins come from `ServerConfig::cors_origins`
// (`SCROLLLIVE_CORS_ORIGINS`, comma-separated). Unset means the local
// development origins of the web client.

use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::REQUEST_ID_HEADER;

const DEFAULT_DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

/// - `"*"` allows any origin without credentials.
/// - A comma-separated list allows exactly those origins.
/// - `None` allows the development origins.
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::IF_MATCH,
            request_id.clone(),
        ])
        .expose_headers([request_id, header::ETAG])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(3600));

    match origins.map(str::trim) {
        Some("*") => base.allow_origin(AllowOrigin::any()).allow_credentials(false),
        Some(origins) => base.allow_origin(parse_origins(origins)),
        None => base.allow_origin(parse_origins(&DEFAULT_DEV_ORIGINS.join(","))),
    }
}

fn parse_origins(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| HeaderValue::from_str(s).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, Response},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    fn test_app(origins: Option<&str>) -> Router {
        Router::new().route("/test", get(|| async { "ok" })).layer(cors_layer(origins))
    }

    async fn preflight(origins: Option<&str>, origin: &str) -> Response<Body> {
        test_app(origins)
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/test")
                    .header("origin", origin)
                    .header("access-control-request-method", "PATCH")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return response")
    }

    #[tokio::test]
    async fn preflight_allows_dev_origin_with_credentials() {
        let response = preflight(None, "http://localhost:5173").await;

        assert_eq!(
            response.headers().get("access-control-allow-origin").expect("allow origin"),
            "http://localhost:5173"
        );
        assert_eq!(
            response.headers().get("access-control-allow-credentials").expect("credentials"),
            "true"
        );
        assert_eq!(response.headers().get("access-control-max-age").expect("max age"), "3600");
    }

    #[tokio::test]
    async fn preflight_rejects_unknown_origin() {
        let response = preflight(None, "https://evil.example.com").await;

        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn configured_origins_replace_dev_defaults() {
        let origins = Some("https://live.example.com, https://staging.example.com");

        let allowed = preflight(origins, "https://staging.example.com").await;
        assert_eq!(
            allowed.headers().get("access-control-allow-origin").expect("allow origin"),
            "https://staging.example.com"
        );

        let dev = preflight(origins, "http://localhost:3000").await;
        assert!(dev.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn wildcard_origin_disables_credentials() {
        let response = preflight(Some("*"), "https://anything.example.com").await;

        assert_eq!(response.headers().get("access-control-allow-origin").expect("origin"), "*");
        assert!(response.headers().get("access-control-allow-credentials").is_none());
    }

    #[tokio::test]
    async fn simple_get_exposes_etag_and_request_id() {
        let response = test_app(None)
            .oneshot(
                Request::builder()
                    .uri("/test")
                    .header("origin", "http://localhost:3000")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return response");

        let exposed = response
            .headers()
            .get("access-control-expose-headers")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        assert!(exposed.contains("etag"));
        assert!(exposed.contains("x-request-id"));
    }

    #[test]
    fn parse_origins_handles_whitespace() {
        let origins = parse_origins("  https://a.com , https://b.com  , ");
        assert_eq!(origins, vec!["https://a.com", "https://b.com"]);
    }
}
