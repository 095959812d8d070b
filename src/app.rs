use axum::{extract::FromRef, middleware, routing::get, Extension, Router};
use std::{sync::Arc, time::Duration};
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::handlers::{
    cors_layer, error_handler, get_user, health_check, hello, metrics_handler, ServiceInfo,
};
use crate::observability::{
    metrics_middleware, tracing_middleware, Metrics, Telemetry, TracingState,
};

/// Router state shared by all handlers
#[derive(Debug, Clone)]
pub struct AppState {
    pub metrics: Arc<Metrics>,
    pub info: ServiceInfo,
}

impl FromRef<AppState> for Arc<Metrics> {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

impl FromRef<AppState> for ServiceInfo {
    fn from_ref(state: &AppState) -> Self {
        state.info.clone()
    }
}

/// Builds the service router with the full observability stack.
pub fn create_app(telemetry: &Telemetry, service_name: &str, request_timeout: Duration) -> Router {
    let state = AppState {
        metrics: telemetry.metrics.clone(),
        info: ServiceInfo {
            service_name: service_name.to_string(),
            tracing_enabled: telemetry.spans.is_enabled(),
        },
    };

    let router = Router::new()
        .route("/hello", get(hello))
        .route("/api/users/:id", get(get_user))
        .route("/error", get(error_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health/status", get(health_check))
        .with_state(state);

    with_observability(router, telemetry, request_timeout)
}

/// Wraps `router` in the request pipeline.
///
/// Layers, innermost first: metrics, tracing, log sink extension, CORS,
/// HTTP diagnostics, timeout, panic recovery. Tracing has to wrap metrics so the metrics
/// middleware finds the request span. A panicking handler unwinds through
/// both middlewares, whose guards still record the request, and is answered
/// with a 500 by the outermost layer.
pub fn with_observability(
    router: Router,
    telemetry: &Telemetry,
    request_timeout: Duration,
) -> Router {
    let metrics = telemetry.metrics.clone();
    let tracing_state =
        TracingState::new(telemetry.spans.clone()).with_request_timeout(request_timeout);

    router
        .layer(middleware::from_fn(move |req, next| {
            metrics_middleware(metrics.clone(), req, next)
        }))
        .layer(middleware::from_fn(move |req, next| {
            tracing_middleware(tracing_state.clone(), req, next)
        }))
        .layer(Extension(telemetry.log_sink.clone()))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CatchPanicLayer::new())
}
