use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, MatchedPath},
    http::{header::USER_AGENT, request::Parts, Method, StatusCode},
};
use serde_json::Value;
use std::time::Duration;

use super::{
    context::RequestContext,
    log_sink::{LogError, LogLevel, LogRecord, SharedLogSink},
};

/// Leveled request logging for handlers.
///
/// Every record starts with `method`, `path`, `route` (when matched),
/// `user_agent` and `status`, followed by the caller's attributes, and is
/// handed to the shared sink together with the request context.
///
/// `status` is whatever was set at call time, 200 until
/// [`RequestLog::set_status`] is called.
#[derive(Clone)]
pub struct RequestLog {
    sink: SharedLogSink,
    cx: RequestContext,
    method: Method,
    path: String,
    route: Option<String>,
    user_agent: String,
    status: StatusCode,
}

impl RequestLog {
    pub fn new(sink: SharedLogSink, cx: RequestContext, parts: &Parts) -> Self {
        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        Self {
            sink,
            cx,
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            route: parts
                .extensions
                .get::<MatchedPath>()
                .map(|matched| matched.as_str().to_string()),
            user_agent,
            status: StatusCode::OK,
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.cx
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Time since the request entered the middleware chain.
    pub fn elapsed(&self) -> Duration {
        self.cx.elapsed()
    }

    pub fn debug(&self, message: &str, extra: &[(&str, Value)]) -> Result<(), LogError> {
        self.log(LogLevel::Debug, message, extra)
    }

    pub fn info(&self, message: &str, extra: &[(&str, Value)]) -> Result<(), LogError> {
        self.log(LogLevel::Info, message, extra)
    }

    pub fn warn(&self, message: &str, extra: &[(&str, Value)]) -> Result<(), LogError> {
        self.log(LogLevel::Warn, message, extra)
    }

    pub fn error(&self, message: &str, extra: &[(&str, Value)]) -> Result<(), LogError> {
        self.log(LogLevel::Error, message, extra)
    }

    pub fn log(
        &self,
        level: LogLevel,
        message: &str,
        extra: &[(&str, Value)],
    ) -> Result<(), LogError> {
        if !self.sink.enabled(level) {
            return Ok(());
        }

        let mut record = LogRecord::new(level, message)
            .with_attr("method", self.method.as_str())
            .with_attr("path", self.path.as_str());
        if let Some(route) = &self.route {
            record.add("route", route.as_str());
        }
        record.add("user_agent", self.user_agent.as_str());
        record.add("status", self.status.as_u16());
        for (key, value) in extra {
            record.add(*key, value.clone());
        }

        self.sink.handle(&self.cx, record)
    }
}

impl std::fmt::Debug for RequestLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLog")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("route", &self.route)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestLog
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let sink = parts
            .extensions
            .get::<SharedLogSink>()
            .cloned()
            .ok_or((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Request log sink is not configured",
            ))?;

        // Without the tracing middleware the records fall back to the
        // sentinel trace id.
        let cx = parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_default();

        Ok(RequestLog::new(sink, cx, parts))
    }
}
