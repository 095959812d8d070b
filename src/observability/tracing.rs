use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{self, RandomIdGenerator, Sampler},
    Resource,
};
use std::{io, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{info, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use super::{
    log_sink::{JsonSink, LogLevel, SharedLogSink, TraceIdSink},
    metrics::{Metrics, MetricsError, MetricsOptions},
    span::SpanManager,
};
use crate::config::ObservabilityConfig;

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Failed to initialize OpenTelemetry: {0}")]
    OpenTelemetryInit(#[from] opentelemetry::trace::TraceError),
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),
    #[error("Failed to initialize metrics: {0}")]
    Metrics(#[from] MetricsError),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Telemetry components built once at startup and injected into the router.
#[derive(Clone)]
pub struct Telemetry {
    pub spans: SpanManager,
    pub metrics: Arc<Metrics>,
    pub log_sink: SharedLogSink,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("spans", &self.spans)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

/// Request log sink writing trace-correlated JSON lines to stdout.
pub fn stdout_log_sink(min_level: LogLevel) -> SharedLogSink {
    Arc::new(TraceIdSink::new(JsonSink::new(io::stdout, min_level)))
}

/// Initialize tracing, metrics and the request log sink.
///
/// Diagnostic logs of the service go to stderr through `tracing`; stdout is
/// reserved for request logs.
pub fn init_observability(config: &ObservabilityConfig) -> Result<Telemetry, ObservabilityError> {
    let min_level: LogLevel = config
        .log_level
        .parse()
        .map_err(ObservabilityError::Config)?;

    // Initialize OpenTelemetry tracer
    let tracer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => Some(init_opentelemetry_tracer(
            &config.service_name,
            &config.service_version,
            &otlp_endpoint_url(endpoint, config.otlp_insecure),
        )?),
        None => None,
    };

    // Create OpenTelemetry layer
    let opentelemetry_layer = tracer.clone().map(OpenTelemetryLayer::new);

    // Create environment filter
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter_directive(min_level)));

    if config.enable_json_logging {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(opentelemetry_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_current_span(false)
                    .with_span_list(false)
                    .with_target(false)
                    .with_span_events(FmtSpan::NONE),
            )
            .try_init()
            .map_err(|e| ObservabilityError::TracingInit(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(opentelemetry_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_span_events(FmtSpan::NONE),
            )
            .try_init()
            .map_err(|e| ObservabilityError::TracingInit(e.to_string()))?;
    }

    info!(
        "Initializing observability for service: {} v{}",
        config.service_name, config.service_version
    );

    // Export failures must not reach the request log sink.
    if let Err(e) = global::set_error_handler(|error| {
        warn!(error = %error, "OpenTelemetry error");
    }) {
        warn!(error = %e, "Failed to install OpenTelemetry error handler");
    }

    let spans = match tracer {
        Some(tracer) => SpanManager::from_tracer(tracer),
        None => {
            warn!("No OTLP endpoint configured, request spans will not be exported");
            SpanManager::disabled()
        }
    };

    let metrics = Arc::new(Metrics::with_options(MetricsOptions {
        trace_id_label: config.metrics_trace_id_label,
    })?);

    info!("Observability initialized successfully");
    Ok(Telemetry {
        spans,
        metrics,
        log_sink: stdout_log_sink(min_level),
    })
}

/// Filter used when `RUST_LOG` is unset. Diagnostics are emitted under this
/// crate's target whatever the configured service name is.
pub fn default_filter_directive(level: LogLevel) -> String {
    let level = match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };
    format!("{}={},tower_http=info", env!("CARGO_CRATE_NAME"), level)
}

/// Adds a scheme to bare `host:port` endpoints.
pub fn otlp_endpoint_url(endpoint: &str, insecure: bool) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else if insecure {
        format!("http://{}", endpoint)
    } else {
        format!("https://{}", endpoint)
    }
}

/// Initialize OpenTelemetry tracer with a batching OTLP exporter
fn init_opentelemetry_tracer(
    service_name: &str,
    service_version: &str,
    otlp_endpoint: &str,
) -> Result<opentelemetry_sdk::trace::Tracer, ObservabilityError> {
    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", service_version.to_string()),
    ]);

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(otlp_endpoint);

    // Build tracer pipeline
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            trace::config()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_max_events_per_span(64)
                .with_max_attributes_per_span(16)
                .with_max_links_per_span(16)
                .with_resource(resource),
        )
        .with_batch_config(
            trace::BatchConfig::default()
                .with_max_queue_size(2048)
                .with_max_export_batch_size(512)
                .with_max_export_timeout(Duration::from_secs(30))
                .with_scheduled_delay(Duration::from_millis(500)),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    Ok(tracer)
}

/// Shutdown observability gracefully with timeout
pub async fn shutdown_observability() {
    info!("Shutting down observability");

    // Flushing pending spans may block, keep it off the runtime threads.
    let shutdown_task = tokio::task::spawn_blocking(|| {
        global::shutdown_tracer_provider();
    });

    match tokio::time::timeout(Duration::from_secs(5), shutdown_task).await {
        Ok(Ok(())) => {
            info!("Observability shutdown completed successfully");
        }
        Ok(Err(e)) => {
            warn!("Error during observability shutdown: {}", e);
        }
        Err(_) => {
            warn!("Observability shutdown timed out after 5 seconds - forcing exit");
        }
    }
}
