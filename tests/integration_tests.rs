use std::collections::HashSet;
use std::time::Duration;

use axum::{middleware, routing::get, Extension, Router};
use serde_json::Value;

use tracewire::{
    handlers::{error_handler, hello},
    observability::{metrics_middleware, tracing_middleware, TracingState, NO_TRACE},
    AppState,
};

mod common;
use common::*;

fn is_trace_id(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|id| id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit()))
}

#[tokio::test]
async fn test_error_request_is_logged_traced_and_counted() {
    let env = TestEnvironment::new().await;

    let response = env
        .client
        .get(env.url("/error?error=1"))
        .header("user-agent", "integration-test")
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status().as_u16(), 500);
    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body, serde_json::json!({"msg": "error"}));

    let lines = env.logs.lines();
    assert_eq!(lines.len(), 1);
    let line = &lines[0];
    assert_eq!(line["level"], "ERROR");
    assert_eq!(line["method"], "GET");
    assert_eq!(line["path"], "/error");
    assert_eq!(line["user_agent"], "integration-test");
    assert_eq!(line["status"], 500);
    assert!(line["duration_ms"].as_f64().is_some_and(|ms| ms >= 0.0));
    assert!(is_trace_id(&line["traceID"]));

    // The log line and the metric sample share the trace id.
    assert_eq!(env.metrics().requests_total("GET", "/error"), 1);
    assert_eq!(env.metrics().duration_samples("GET", "/error"), 1);
    let labels = counter_trace_ids(&env.metrics().encode().unwrap());
    assert_eq!(labels, vec![line["traceID"].as_str().unwrap().to_string()]);
}

#[tokio::test]
async fn test_error_endpoint_without_flag_succeeds() {
    let env = TestEnvironment::new().await;

    let response = env
        .client
        .get(env.url("/error"))
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["msg"], "ok");

    let lines = env.logs.lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["level"], "INFO");
    assert_eq!(lines[0]["status"], 200);
    assert!(is_trace_id(&lines[0]["traceID"]));
    assert_eq!(env.metrics().requests_total("GET", "/error"), 1);
}

#[tokio::test]
async fn test_concurrent_requests_get_distinct_trace_ids() {
    const REQUESTS: usize = 25;
    let env = TestEnvironment::new().await;

    let mut handles = Vec::with_capacity(REQUESTS);
    for i in 0..REQUESTS {
        let client = env.client.clone();
        let url = env.url(&format!("/api/users/{}", i));
        handles.push(tokio::spawn(async move {
            client.get(url).send().await.map(|r| r.status().as_u16())
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 200);
    }

    let lines = env.logs.lines();
    assert_eq!(lines.len(), REQUESTS);
    let trace_ids: HashSet<String> = lines
        .iter()
        .map(|line| {
            assert!(is_trace_id(&line["traceID"]));
            line["traceID"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(trace_ids.len(), REQUESTS);

    assert_eq!(
        env.metrics().requests_total("GET", "/api/users/:id"),
        REQUESTS as u64
    );
    let labels: HashSet<String> = counter_trace_ids(&env.metrics().encode().unwrap())
        .into_iter()
        .collect();
    assert_eq!(labels, trace_ids);
}

#[tokio::test]
async fn test_inbound_traceparent_is_continued() {
    let env = TestEnvironment::new().await;

    let response = env
        .client
        .get(env.url("/hello"))
        .header(
            "traceparent",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        )
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status().as_u16(), 200);

    let lines = env.logs.lines();
    assert_eq!(lines[0]["traceID"], "0af7651916cd43dd8448eb211c80319c");
    assert_eq!(env.metrics().request_count.get(), 1);
}

#[tokio::test]
async fn test_reversed_middleware_order_labels_no_trace() {
    let logs = CapturedLogs::default();
    let telemetry = test_telemetry(&logs);
    let metrics = telemetry.metrics.clone();
    let tracing_state = TracingState::new(telemetry.spans.clone());
    let state = AppState {
        metrics: metrics.clone(),
        info: tracewire::handlers::ServiceInfo {
            service_name: "reversed".to_string(),
            tracing_enabled: true,
        },
    };

    // Metrics outside tracing: the span does not exist yet when metrics run.
    let app = Router::new()
        .route("/hello", get(hello))
        .route("/error", get(error_handler))
        .with_state(state)
        .layer(middleware::from_fn(move |req, next| {
            tracing_middleware(tracing_state.clone(), req, next)
        }))
        .layer(middleware::from_fn({
            let metrics = metrics.clone();
            move |req, next| metrics_middleware(metrics.clone(), req, next)
        }))
        .layer(Extension(telemetry.log_sink.clone()));
    let base_url = spawn_server(app).await;

    let client = reqwest::Client::new();
    for path in ["/hello", "/error?error=1", "/hello"] {
        client
            .get(format!("{}{}", base_url, path))
            .send()
            .await
            .expect("Failed to send request");
    }

    let labels = counter_trace_ids(&metrics.encode().unwrap());
    assert!(!labels.is_empty());
    assert!(labels.iter().all(|label| label == NO_TRACE));

    // Handlers still run inside the span.
    assert!(logs.lines().iter().all(|line| is_trace_id(&line["traceID"])));
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_prometheus_text() {
    let env = TestEnvironment::new().await;

    env.client
        .get(env.url("/hello"))
        .send()
        .await
        .expect("Failed to send request");

    let response = env
        .client
        .get(env.url("/metrics"))
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; version=0.0.4; charset=utf-8"
    );
    let body = response.text().await.unwrap();
    assert!(body.contains("http_request_total"));
    assert!(body.contains("http_request_duration_seconds_bucket"));
    assert!(body.contains("request_count 1"));
}

#[tokio::test]
async fn test_health_check() {
    let env = TestEnvironment::new().await;

    let response = env
        .client
        .get(env.url("/health/status"))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "tracewire-test");
    assert_eq!(body["tracing_enabled"], true);
}

#[tokio::test]
async fn test_unknown_route_is_counted_under_raw_path() {
    let env = TestEnvironment::new().await;

    let response = env
        .client
        .get(env.url("/does/not/exist"))
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status().as_u16(), 404);
    assert_eq!(env.metrics().requests_total("GET", "/does/not/exist"), 1);
    assert!(env.logs.lines().is_empty());
}
