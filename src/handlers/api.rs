use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{instrument, warn};

use crate::models::{MessageResponse, UserResponse};
use crate::observability::{Metrics, RequestLog};

/// Query parameters for the error endpoint
#[derive(Debug, Default, Deserialize)]
pub struct ErrorQuery {
    pub error: Option<String>,
}

impl ErrorQuery {
    fn wants_error(&self) -> bool {
        self.error.as_deref() == Some("1")
    }
}

/// Greets the caller and bumps the demo request counter
#[instrument(name = "hello", skip(metrics, log))]
pub async fn hello(State(metrics): State<Arc<Metrics>>, log: RequestLog) -> Json<MessageResponse> {
    metrics.request_count.inc();

    if let Err(e) = log.info("hello", &[]) {
        warn!(error = %e, "Failed to write request log");
    }

    Json(MessageResponse::new("ok"))
}

#[instrument(name = "get_user", skip(log))]
pub async fn get_user(Path(user_id): Path<String>, log: RequestLog) -> Json<UserResponse> {
    if let Err(e) = log.info("user lookup", &[("user_id", json!(user_id))]) {
        warn!(error = %e, "Failed to write request log");
    }

    Json(UserResponse { user_id })
}

/// Fails with 500 when called with `?error=1`, succeeds otherwise.
#[instrument(name = "handleRequest", skip(log))]
pub async fn error_handler(
    Query(query): Query<ErrorQuery>,
    mut log: RequestLog,
) -> (StatusCode, Json<MessageResponse>) {
    let (status, message) = if query.wants_error() {
        (StatusCode::INTERNAL_SERVER_ERROR, "error")
    } else {
        (StatusCode::OK, "ok")
    };
    log.set_status(status);

    let duration_ms = json!(log.elapsed().as_secs_f64() * 1000.0);
    let result = if status.is_server_error() {
        log.error("request failed", &[("duration_ms", duration_ms)])
    } else {
        log.info("request succeeded", &[("duration_ms", duration_ms)])
    };
    if let Err(e) = result {
        warn!(error = %e, "Failed to write request log");
    }

    (status, Json(MessageResponse::new(message)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{
        JsonSink, LogLevel, RequestContext, SharedLogSink, SpanManager, TraceIdSink, NO_TRACE,
    };
    use axum::{body::Body, http::Request, routing::get, Extension, Router};
    use serde_json::Value;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn lines(&self) -> Vec<Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
        type Writer = <Mutex<Vec<u8>> as tracing_subscriber::fmt::MakeWriter<'a>>::Writer;

        fn make_writer(&'a self) -> Self::Writer {
            <Mutex<Vec<u8>> as tracing_subscriber::fmt::MakeWriter<'a>>::make_writer(&self.0)
        }
    }

    fn app(metrics: Arc<Metrics>, captured: Captured) -> Router {
        let sink: SharedLogSink =
            Arc::new(TraceIdSink::new(JsonSink::new(captured, LogLevel::Debug)));
        Router::new()
            .route("/hello", get(hello))
            .route("/api/users/:id", get(get_user))
            .route("/error", get(error_handler))
            .with_state(metrics)
            .layer(Extension(sink))
    }

    async fn call(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_error_endpoint_logs_error_with_status() {
        let captured = Captured::default();
        let app = app(Arc::new(Metrics::new().unwrap()), captured.clone());

        let (status, body) = call(app, "/error?error=1").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, r#"{"msg":"error"}"#);

        let lines = captured.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["level"], "ERROR");
        assert_eq!(lines[0]["method"], "GET");
        assert_eq!(lines[0]["path"], "/error");
        assert_eq!(lines[0]["status"], 500);
        assert!(lines[0]["duration_ms"].is_number());
        // No request context was installed, so the sentinel is used.
        assert_eq!(lines[0]["traceID"], NO_TRACE);
    }

    #[tokio::test]
    async fn test_error_endpoint_without_flag_succeeds() {
        let captured = Captured::default();
        let app = app(Arc::new(Metrics::new().unwrap()), captured.clone());

        let (status, body) = call(app, "/error?error=0").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"msg":"ok"}"#);
        let lines = captured.lines();
        assert_eq!(lines[0]["level"], "INFO");
        assert_eq!(lines[0]["status"], 200);
    }

    #[tokio::test]
    async fn test_hello_increments_request_count() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let app = app(metrics.clone(), Captured::default());

        let (status, body) = call(app.clone(), "/hello").await;
        call(app, "/hello").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"msg":"ok"}"#);
        assert_eq!(metrics.request_count.get(), 2);
    }

    #[tokio::test]
    async fn test_get_user_echoes_id_and_uses_request_context() {
        let captured = Captured::default();
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
                .parse()
                .unwrap(),
        );
        let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
        let (cx, _guard) =
            SpanManager::new(&provider).start_span(&RequestContext::from_headers(&headers), "user");
        let app = app(Arc::new(Metrics::new().unwrap()), captured.clone()).layer(Extension(cx));

        let (status, body) = call(app, "/api/users/42").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"user_id":"42"}"#);
        let lines = captured.lines();
        assert_eq!(lines[0]["user_id"], "42");
        assert_eq!(lines[0]["route"], "/api/users/:id");
        assert_eq!(lines[0]["traceID"], "4bf92f3577b34da6a3ce929d0e0e4736");
    }

    #[tokio::test]
    async fn test_missing_log_sink_is_rejected() {
        let app = Router::new()
            .route("/hello", get(hello))
            .with_state(Arc::new(Metrics::new().unwrap()));

        let (status, _) = call(app, "/hello").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
