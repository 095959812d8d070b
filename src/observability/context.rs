use axum::http::HeaderMap;
use opentelemetry::{
    propagation::{Extractor, TextMapPropagator},
    trace::{SpanContext, SpanId, TraceContextExt, TraceId},
    Context,
};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::{
    sync::{Arc, OnceLock},
    time::{Duration, Instant, SystemTime},
};

/// Value used wherever a trace id is expected but no valid span is active.
pub const NO_TRACE: &str = "no trace";

/// How a span finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanOutcome {
    Ok,
    Error(String),
    /// The owning guard was dropped before the span was ended.
    Aborted,
}

#[derive(Debug, Clone)]
struct SpanEnd {
    at: SystemTime,
    outcome: SpanOutcome,
}

/// One traced operation, shared between the request context and the guard
/// that ends it.
#[derive(Debug)]
pub struct ActiveSpan {
    name: String,
    span_context: SpanContext,
    parent_span_id: Option<SpanId>,
    start_time: SystemTime,
    end: OnceLock<SpanEnd>,
    otel_cx: Context,
}

impl ActiveSpan {
    pub(crate) fn new(
        name: impl Into<String>,
        otel_cx: Context,
        parent_span_id: Option<SpanId>,
    ) -> Self {
        let span_context = otel_cx.span().span_context().clone();
        Self {
            name: name.into(),
            span_context,
            parent_span_id,
            start_time: SystemTime::now(),
            end: OnceLock::new(),
            otel_cx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trace_id(&self) -> TraceId {
        self.span_context.trace_id()
    }

    pub fn span_id(&self) -> SpanId {
        self.span_context.span_id()
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent_span_id
    }

    /// A span is valid when both its trace id and span id are non-zero.
    pub fn is_valid(&self) -> bool {
        self.span_context.is_valid()
    }

    /// Canonical 32-character lowercase hex trace id, only for valid spans.
    pub fn trace_id_hex(&self) -> Option<String> {
        self.is_valid().then(|| self.trace_id().to_string())
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// `None` until the span has been ended.
    pub fn end_time(&self) -> Option<SystemTime> {
        self.end.get().map(|end| end.at)
    }

    pub fn outcome(&self) -> Option<&SpanOutcome> {
        self.end.get().map(|end| &end.outcome)
    }

    pub fn is_ended(&self) -> bool {
        self.end.get().is_some()
    }

    /// OpenTelemetry context with this span as the active span.
    pub fn otel_context(&self) -> &Context {
        &self.otel_cx
    }

    /// Ends the span. Returns `false` if it had already been ended, in which
    /// case nothing changes.
    pub(crate) fn finish(&self, outcome: SpanOutcome) -> bool {
        let status = match &outcome {
            SpanOutcome::Ok => opentelemetry::trace::Status::Ok,
            SpanOutcome::Error(message) => opentelemetry::trace::Status::error(message.clone()),
            SpanOutcome::Aborted => opentelemetry::trace::Status::error("request aborted"),
        };
        let end = SpanEnd {
            at: SystemTime::now().max(self.start_time),
            outcome,
        };
        if self.end.set(end).is_err() {
            return false;
        }

        let span = self.otel_cx.span();
        span.set_status(status);
        span.end();
        true
    }
}

/// Request-scoped, immutable propagation object.
///
/// Cloning is cheap; deriving a context with [`RequestContext::with_span`]
/// leaves the original untouched.
#[derive(Debug, Clone)]
pub struct RequestContext {
    span: Option<Arc<ActiveSpan>>,
    parent: Context,
    started_at: Instant,
    deadline: Option<Instant>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    /// A root context without a remote parent.
    pub fn new() -> Self {
        Self {
            span: None,
            parent: Context::new(),
            started_at: Instant::now(),
            deadline: None,
        }
    }

    /// Builds the entry context for an inbound request, continuing any
    /// W3C trace context carried in `traceparent`/`tracestate`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let parent = TraceContextPropagator::new().extract(&HeaderExtractor(headers));
        Self {
            parent,
            ..Self::new()
        }
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(self.started_at + timeout)
    }

    /// Derives a new context carrying `span`.
    pub fn with_span(&self, span: Arc<ActiveSpan>) -> Self {
        Self {
            span: Some(span),
            ..self.clone()
        }
    }

    /// The attached span, or `None` when no span was ever attached. An
    /// attached span may still be invalid (tracing disabled).
    pub fn span(&self) -> Option<&ActiveSpan> {
        self.span.as_deref()
    }

    pub(crate) fn span_arc(&self) -> Option<Arc<ActiveSpan>> {
        self.span.clone()
    }

    pub fn trace_id_hex(&self) -> Option<String> {
        self.span().and_then(ActiveSpan::trace_id_hex)
    }

    /// Hex trace id, or [`NO_TRACE`].
    pub fn trace_label(&self) -> String {
        self.trace_id_hex().unwrap_or_else(|| NO_TRACE.to_string())
    }

    /// The context new child spans should be parented on.
    pub fn otel_context(&self) -> &Context {
        match &self.span {
            Some(span) => span.otel_context(),
            None => &self.parent,
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}
