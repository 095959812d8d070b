use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use opentelemetry::KeyValue;
use std::{sync::Arc, time::Duration};
use tracing::{debug, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::{context::RequestContext, span::SpanManager, Metrics};

/// Route pattern when the router matched one, raw path otherwise.
pub fn route_label(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched_path| matched_path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string())
}

/// Per-request tracing settings shared by every request.
#[derive(Debug, Clone)]
pub struct TracingState {
    pub spans: SpanManager,
    pub request_timeout: Option<Duration>,
}

impl TracingState {
    pub fn new(spans: SpanManager) -> Self {
        Self {
            spans,
            request_timeout: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

/// Opens the request span, stores the derived [`RequestContext`] in the
/// request extensions and ends the span once the inner chain returns.
///
/// Must sit outside [`metrics_middleware`], otherwise the metrics see no
/// span.
pub async fn tracing_middleware(state: TracingState, mut request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let route = route_label(&request);

    let mut entry = RequestContext::from_headers(request.headers());
    if let Some(timeout) = state.request_timeout {
        entry = entry.with_timeout(timeout);
    }

    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let (cx, guard) = state.spans.start_span_with(
        &entry,
        &route,
        vec![
            KeyValue::new("http.method", method.clone()),
            KeyValue::new("http.route", route.clone()),
            KeyValue::new("http.target", request.uri().to_string()),
            KeyValue::new("user_agent.original", user_agent),
        ],
    );
    let trace_id = cx.trace_label();
    request.extensions_mut().insert(cx.clone());

    // Diagnostic events emitted by handlers nest under the request span.
    let handler_span = tracing::info_span!(
        "handle_request",
        http.method = %method,
        http.route = %route,
        trace_id = %trace_id,
    );
    handler_span.set_parent(cx.otel_context().clone());

    let response = next.run(request).instrument(handler_span).await;

    debug!(
        trace_id = %trace_id,
        status_code = response.status().as_u16(),
        "Ending request span"
    );
    guard.end_with_status(response.status());

    response
}

/// Counts the request and observes its duration, labeled with the method,
/// route pattern and the trace id found on the request context.
pub async fn metrics_middleware(metrics: Arc<Metrics>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = route_label(&request);
    let trace_id = request
        .extensions()
        .get::<RequestContext>()
        .and_then(RequestContext::trace_id_hex);

    let timer = metrics.start_request(method, path, trace_id);
    let response = next.run(request).await;
    timer.finish();

    response
}
