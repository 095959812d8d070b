use axum::http::{header, Method};
use std::time::Duration;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

const CORS_MAX_AGE: Duration = Duration::from_secs(12 * 60 * 60);

/// CORS layer for browser clients.
///
/// Credentials are allowed, so the origin and the requested headers are
/// mirrored instead of answered with `*`.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_credentials(true)
        .expose_headers([header::CONTENT_LENGTH])
        .max_age(CORS_MAX_AGE)
}
