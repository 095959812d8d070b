#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use opentelemetry_sdk::trace::TracerProvider;
use reqwest::Client;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing_subscriber::fmt::MakeWriter;

use tracewire::{
    create_app,
    observability::{
        JsonSink, LogLevel, MetricsOptions, SharedLogSink, SpanManager, TraceIdSink,
    },
    Metrics, Telemetry,
};

/// In-memory request log stream, one JSON document per line.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn lines(&self) -> Vec<Value> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .expect("log output is not UTF-8")
            .lines()
            .map(|line| serde_json::from_str(line).expect("log line is not JSON"))
            .collect()
    }

    pub fn sink(&self) -> SharedLogSink {
        Arc::new(TraceIdSink::new(JsonSink::new(self.clone(), LogLevel::Debug)))
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = <Mutex<Vec<u8>> as MakeWriter<'a>>::Writer;

    fn make_writer(&'a self) -> Self::Writer {
        <Mutex<Vec<u8>> as MakeWriter<'a>>::make_writer(&self.0)
    }
}

/// Telemetry with a local SDK tracer and the `traceID` metric label on, so
/// log lines and samples can be joined on the trace id.
pub fn test_telemetry(logs: &CapturedLogs) -> Telemetry {
    let provider = TracerProvider::builder().build();
    Telemetry {
        spans: SpanManager::new(&provider),
        metrics: Arc::new(
            Metrics::with_options(MetricsOptions {
                trace_id_label: true,
            })
            .expect("Failed to create metrics"),
        ),
        log_sink: logs.sink(),
    }
}

/// Serves `app` on an ephemeral port and returns its base URL.
pub async fn spawn_server(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to get local address");

    tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("Failed to serve app");
    });

    // Wait for server to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://{}", addr)
}

pub struct TestEnvironment {
    pub client: Client,
    pub base_url: String,
    pub telemetry: Telemetry,
    pub logs: CapturedLogs,
}

impl TestEnvironment {
    pub async fn new() -> Self {
        let logs = CapturedLogs::default();
        let telemetry = test_telemetry(&logs);
        let app = create_app(&telemetry, "tracewire-test", Duration::from_secs(5));

        Self {
            client: Client::new(),
            base_url: spawn_server(app).await,
            telemetry,
            logs,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn metrics(&self) -> &Metrics {
        &self.telemetry.metrics
    }
}

/// `traceID` label values of every `http_request_total` sample in a
/// Prometheus text exposition.
pub fn counter_trace_ids(encoded: &str) -> Vec<String> {
    encoded
        .lines()
        .filter(|line| line.starts_with("http_request_total{"))
        .filter_map(|line| {
            let start = line.find("traceID=\"")? + "traceID=\"".len();
            let end = line[start..].find('"')? + start;
            Some(line[start..end].to_string())
        })
        .collect()
}
