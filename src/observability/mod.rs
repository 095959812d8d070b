pub mod context;
pub mod log_sink;
pub mod metrics;
pub mod middleware;
pub mod request_log;
pub mod span;
pub mod tracing;

pub use context::{ActiveSpan, RequestContext, SpanOutcome, NO_TRACE};
pub use log_sink::{
    JsonSink, LogError, LogLevel, LogRecord, LogSink, SharedLogSink, TraceIdSink, TRACE_ID_KEY,
};
pub use metrics::{Metrics, MetricsError, MetricsOptions, RequestTimer};
pub use middleware::{metrics_middleware, route_label, tracing_middleware, TracingState};
pub use request_log::RequestLog;
pub use span::{SpanGuard, SpanManager};
pub use tracing::{
    init_observability, shutdown_observability, stdout_log_sink, ObservabilityError, Telemetry,
};
