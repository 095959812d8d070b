use axum::http::StatusCode;
use opentelemetry::{
    trace::{SpanKind, TraceContextExt, Tracer as _, TracerProvider as _},
    Context, KeyValue,
};
use opentelemetry_sdk::trace::{Tracer, TracerProvider};
use std::sync::Arc;

use super::context::{ActiveSpan, RequestContext, SpanOutcome};

const TRACER_NAME: &str = "tracewire/http";

/// Starts and ends one server span per request.
///
/// Cloning is cheap. The manager keeps its provider alive so spans started
/// through it stay recordable for as long as the manager exists.
#[derive(Clone)]
pub struct SpanManager {
    inner: Arc<Backend>,
}

enum Backend {
    Sdk {
        tracer: Tracer,
        // Tracers only hold a weak reference to their provider.
        _provider: Option<TracerProvider>,
    },
    Disabled,
}

impl std::fmt::Debug for SpanManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanManager")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl SpanManager {
    pub fn new(provider: &TracerProvider) -> Self {
        Self {
            inner: Arc::new(Backend::Sdk {
                tracer: provider.tracer(TRACER_NAME),
                _provider: Some(provider.clone()),
            }),
        }
    }

    /// Wraps a tracer whose provider is owned elsewhere (e.g. installed as
    /// the global provider by the OTLP pipeline).
    pub fn from_tracer(tracer: Tracer) -> Self {
        Self {
            inner: Arc::new(Backend::Sdk {
                tracer,
                _provider: None,
            }),
        }
    }

    /// No tracing backend: spans are attached but never valid.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(Backend::Disabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(*self.inner, Backend::Sdk { .. })
    }

    pub fn start_span(&self, parent: &RequestContext, name: &str) -> (RequestContext, SpanGuard) {
        self.start_span_with(parent, name, Vec::new())
    }

    /// Starts a server span named `name` as a child of `parent` and returns
    /// the derived context together with the guard that ends the span.
    pub fn start_span_with(
        &self,
        parent: &RequestContext,
        name: &str,
        attributes: Vec<KeyValue>,
    ) -> (RequestContext, SpanGuard) {
        let parent_cx = parent.otel_context();
        let parent_span_context = parent_cx.span().span_context().clone();
        let parent_span_id = parent_span_context
            .is_valid()
            .then(|| parent_span_context.span_id());

        let otel_cx = match &*self.inner {
            Backend::Sdk { tracer, .. } => {
                let span = tracer
                    .span_builder(name.to_string())
                    .with_kind(SpanKind::Server)
                    .with_attributes(attributes)
                    .start_with_context(tracer, parent_cx);
                parent_cx.with_span(span)
            }
            Backend::Disabled => Context::new(),
        };

        let span = Arc::new(ActiveSpan::new(name, otel_cx, parent_span_id));
        let child = parent.with_span(span.clone());
        (child, SpanGuard { span })
    }
}

/// Ends its span exactly once: explicitly through one of the `end*`
/// methods, or on drop with [`SpanOutcome::Aborted`].
#[must_use = "dropping the guard ends the span as aborted"]
#[derive(Debug)]
pub struct SpanGuard {
    span: Arc<ActiveSpan>,
}

impl SpanGuard {
    pub fn span(&self) -> &ActiveSpan {
        &self.span
    }

    pub fn end(self) {
        self.span.finish(SpanOutcome::Ok);
    }

    pub fn end_with_error(self, message: impl Into<String>) {
        self.span.finish(SpanOutcome::Error(message.into()));
    }

    /// Records the response status and ends the span; 5xx marks it as erred.
    pub fn end_with_status(self, status: StatusCode) {
        self.span
            .otel_context()
            .span()
            .set_attribute(KeyValue::new("http.status_code", i64::from(status.as_u16())));

        if status.is_server_error() {
            self.end_with_error(format!("HTTP {}", status.as_u16()));
        } else {
            self.end();
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        // No-op when an `end*` method already ran.
        self.span.finish(SpanOutcome::Aborted);
    }
}
