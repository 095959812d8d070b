use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::{
    sync::{Arc, Mutex},
    time::Instant,
};
use thiserror::Error;
use tracing::info;

use super::context::NO_TRACE;

pub const HTTP_REQUEST_TOTAL: &str = "http_request_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),
    #[error("Failed to encode metrics: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsOptions {
    /// Adds a `traceID` label to the request counter and histogram.
    ///
    /// Every request then gets its own series, so this is meant for demo and
    /// debugging deployments only.
    pub trace_id_label: bool,
}

/// Request metrics for the service, backed by a private registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    options: MetricsOptions,
    // Serializes in-flight updates with the removal of idle series.
    in_flight_lock: Arc<Mutex<()>>,

    // HTTP metrics
    pub http_request_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub http_requests_in_flight: IntGaugeVec,

    // Demo endpoint metrics
    pub request_count: IntCounter,
    pub online_users: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        Self::with_options(MetricsOptions::default())
    }

    /// Create a new metrics instance with all required metrics registered
    pub fn with_options(options: MetricsOptions) -> Result<Self, MetricsError> {
        let registry = Registry::new();

        info!(
            trace_id_label = options.trace_id_label,
            "Initializing Prometheus metrics"
        );

        let request_labels: &[&str] = if options.trace_id_label {
            &["method", "path", "traceID"]
        } else {
            &["method", "path"]
        };

        let http_request_total = IntCounterVec::new(
            Opts::new(HTTP_REQUEST_TOTAL, "Total number of http requests"),
            request_labels,
        )?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                HTTP_REQUEST_DURATION_SECONDS,
                "HTTP request duration in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            request_labels,
        )?;

        let http_requests_in_flight = IntGaugeVec::new(
            Opts::new(
                "http_requests_in_flight",
                "Number of HTTP requests currently being processed",
            ),
            &["method", "path"],
        )?;

        let request_count = IntCounter::new("request_count", "Number of requests received")?;

        let online_users = IntGauge::new("online_users", "Current number of online users")?;

        registry.register(Box::new(http_request_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(http_requests_in_flight.clone()))?;
        registry.register(Box::new(request_count.clone()))?;
        registry.register(Box::new(online_users.clone()))?;

        info!("Prometheus metrics initialized successfully");

        Ok(Metrics {
            registry,
            options,
            in_flight_lock: Arc::new(Mutex::new(())),
            http_request_total,
            http_request_duration_seconds,
            http_requests_in_flight,
            request_count,
            online_users,
        })
    }

    pub fn options(&self) -> MetricsOptions {
        self.options
    }

    /// Get the metrics registry for exposing metrics endpoint
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode all metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;

        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }

    /// Record one finished request.
    ///
    /// `trace_id` is only used when the `traceID` label is enabled; `None`
    /// is recorded as `"no trace"`.
    pub fn record_request(
        &self,
        method: &str,
        path: &str,
        trace_id: Option<&str>,
        duration_seconds: f64,
    ) {
        let duration_seconds = duration_seconds.max(0.0);

        if self.options.trace_id_label {
            let labels = [method, path, trace_id.unwrap_or(NO_TRACE)];
            self.http_request_total.with_label_values(&labels).inc();
            self.http_request_duration_seconds
                .with_label_values(&labels)
                .observe(duration_seconds);
        } else {
            let labels = [method, path];
            self.http_request_total.with_label_values(&labels).inc();
            self.http_request_duration_seconds
                .with_label_values(&labels)
                .observe(duration_seconds);
        }
    }

    /// Increment in-flight requests
    pub fn increment_in_flight(&self, method: &str, path: &str) {
        let _guard = self.in_flight_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.http_requests_in_flight
            .with_label_values(&[method, path])
            .inc();
    }

    /// Decrement in-flight requests. A series that drops back to zero is
    /// removed, so one-off paths do not accumulate.
    pub fn decrement_in_flight(&self, method: &str, path: &str) {
        let _guard = self.in_flight_lock.lock().unwrap_or_else(|e| e.into_inner());
        let gauge = self.http_requests_in_flight.with_label_values(&[method, path]);
        gauge.dec();
        if gauge.get() <= 0 {
            // Only fails when the series is already gone.
            let _ = self
                .http_requests_in_flight
                .remove_label_values(&[method, path]);
        }
    }

    /// Current `http_request_total` for `(method, path)`, summed over every
    /// trace id when that label is enabled.
    pub fn requests_total(&self, method: &str, path: &str) -> u64 {
        self.sum_matching(HTTP_REQUEST_TOTAL, method, path, |metric| {
            metric.get_counter().get_value()
        }) as u64
    }

    /// Number of duration observations for `(method, path)`.
    pub fn duration_samples(&self, method: &str, path: &str) -> u64 {
        self.sum_matching(HTTP_REQUEST_DURATION_SECONDS, method, path, |metric| {
            metric.get_histogram().get_sample_count() as f64
        }) as u64
    }

    fn sum_matching(
        &self,
        name: &str,
        method: &str,
        path: &str,
        value: impl Fn(&prometheus::proto::Metric) -> f64,
    ) -> f64 {
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric())
            .filter(|metric| {
                let labels = metric.get_label();
                let has = |key: &str, expected: &str| {
                    labels
                        .iter()
                        .any(|pair| pair.get_name() == key && pair.get_value() == expected)
                };
                has("method", method) && has("path", path)
            })
            .map(value)
            .sum()
    }

    /// Starts timing a request; the sample is recorded when the returned
    /// timer is finished or dropped.
    pub fn start_request(
        self: &Arc<Self>,
        method: impl Into<String>,
        path: impl Into<String>,
        trace_id: Option<String>,
    ) -> RequestTimer {
        let method = method.into();
        let path = path.into();
        self.increment_in_flight(&method, &path);
        RequestTimer {
            metrics: self.clone(),
            method,
            path,
            trace_id,
            start: Instant::now(),
        }
    }
}

/// Records exactly one request sample when it goes out of scope, so panics
/// and cancelled requests are still counted.
#[derive(Debug)]
pub struct RequestTimer {
    metrics: Arc<Metrics>,
    method: String,
    path: String,
    trace_id: Option<String>,
    start: Instant,
}

impl RequestTimer {
    pub fn finish(self) {}
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        let duration_seconds = self.start.elapsed().as_secs_f64();
        self.metrics.record_request(
            &self.method,
            &self.path,
            self.trace_id.as_deref(),
            duration_seconds,
        );
        self.metrics.decrement_in_flight(&self.method, &self.path);
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
