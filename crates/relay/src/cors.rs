// CORS configuration for the REST endpoints.
//
// Reads allowed origins from `COWRITE_RELAY_CORS_ORIGINS` (comma-separated).
// Falls back to permissive localhost defaults in development.

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Default origins allowed when `COWRITE_RELAY_CORS_ORIGINS` is unset.
const DEFAULT_DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

const CORS_ORIGINS_ENV: &str = "COWRITE_RELAY_CORS_ORIGINS";

/// Build a [`CorsLayer`] from the environment.
///
/// - `"*"` allows any origin (credentials cannot be combined with a wildcard).
/// - A comma-separated list allows exactly those origins.
/// - Unset allows the default development origins.
pub fn cors_layer() -> CorsLayer {
    cors_layer_from_env(std::env::var(CORS_ORIGINS_ENV).ok())
}

fn cors_layer_from_env(env_value: Option<String>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("x-snapshot-version"),
        ])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(3600));

    match env_value.as_deref() {
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
    use axum::{body::Body, http::Request, routing::get, Router};
    use tower::ServiceExt;

    use super::*;

    fn test_app(env_value: Option<String>) -> Router {
        Router::new()
            .route("/test", get(|| async { "ok" }))
            .layer(cors_layer_from_env(env_value))
    }

    #[tokio::test]
    async fn preflight_allows_default_dev_origin() {
        let response = test_app(None)
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/test")
                    .header("origin", "http://localhost:5173")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "http://localhost:5173"
        );
    }

    #[tokio::test]
    async fn preflight_rejects_unknown_origin() {
        let response = test_app(None)
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/test")
                    .header("origin", "https://evil.example.com")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn custom_origins_from_env() {
        let response = test_app(Some("https://app.cowrite.dev,https://staging.cowrite.dev".into()))
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/test")
                    .header("origin", "https://app.cowrite.dev")
                    .header("access-control-request-method", "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "https://app.cowrite.dev"
        );
    }

    #[tokio::test]
    async fn wildcard_origin_disables_credentials() {
        let response = test_app(Some("*".into()))
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/test")
                    .header("origin", "https://anything.example.com")
                    .header("access-control-request-method", "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers().get("access-control-allow-origin").unwrap(), "*");
        assert!(response.headers().get("access-control-allow-credentials").is_none());
    }

    #[test]
    fn parse_origins_handles_whitespace() {
        let origins = parse_origins("  https://a.com , https://b.com  , ");
        assert_eq!(origins.len(), 2);
        assert_eq!(origins[0], "https://a.com");
        assert_eq!(origins[1], "https://b.com");
    }
}
