use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::{fmt, io::Write, str::FromStr, sync::Arc};
use thiserror::Error;
use tracing_subscriber::fmt::MakeWriter;

use super::context::{RequestContext, NO_TRACE};

/// Attribute every request log record carries.
pub const TRACE_ID_KEY: &str = "traceID";

const TIME_KEY: &str = "time";
const LEVEL_KEY: &str = "level";
const MESSAGE_KEY: &str = "msg";
const RESERVED_KEYS: [&str; 3] = [TIME_KEY, LEVEL_KEY, MESSAGE_KEY];

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Failed to write log record: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize log record: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// One structured log line: level, message and ordered attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    time: DateTime<Utc>,
    level: LogLevel,
    message: String,
    attrs: Vec<(String, Value)>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            level,
            message: message.into(),
            attrs: Vec::new(),
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn attrs(&self) -> &[(String, Value)] {
        &self.attrs
    }

    /// Sets an attribute. New keys are appended; an existing key keeps its
    /// position and takes the new value, so a record never holds duplicates.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(name, _)| *name == key) {
            Some((_, existing)) => *existing = value,
            None => self.attrs.push((key, value)),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.add(key, value);
        self
    }

    /// First attribute named `key`.
    pub fn attr(&self, key: &str) -> Option<&Value> {
        self.attrs
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    pub fn attr_count(&self, key: &str) -> usize {
        self.attrs.iter().filter(|(name, _)| name == key).count()
    }

    pub fn remove(&mut self, key: &str) {
        self.attrs.retain(|(name, _)| name != key);
    }

    /// JSON object in output order: `time`, `level`, `msg`, then attributes.
    ///
    /// Attributes named like a core field are written under
    /// `fields.<key>` so they cannot replace it.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        object.insert(
            TIME_KEY.to_string(),
            Value::String(self.time.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        object.insert(LEVEL_KEY.to_string(), Value::from(self.level.as_str()));
        object.insert(MESSAGE_KEY.to_string(), Value::String(self.message.clone()));
        for (key, value) in &self.attrs {
            let key = if RESERVED_KEYS.contains(&key.as_str()) {
                format!("fields.{}", key)
            } else {
                key.clone()
            };
            object.insert(key, value.clone());
        }
        Value::Object(object)
    }
}

/// A structured log writer that receives the request context with every
/// record.
#[cfg_attr(test, mockall::automock)]
pub trait LogSink: Send + Sync {
    fn enabled(&self, _level: LogLevel) -> bool {
        true
    }

    fn handle(&self, cx: &RequestContext, record: LogRecord) -> Result<(), LogError>;
}

pub type SharedLogSink = Arc<dyn LogSink>;

impl<S: LogSink + ?Sized> LogSink for Arc<S> {
    fn enabled(&self, level: LogLevel) -> bool {
        (**self).enabled(level)
    }

    fn handle(&self, cx: &RequestContext, record: LogRecord) -> Result<(), LogError> {
        (**self).handle(cx, record)
    }
}

/// Writes each record as one JSON object per line.
pub struct JsonSink<W> {
    make_writer: W,
    min_level: LogLevel,
}

impl<W> JsonSink<W>
where
    W: for<'a> MakeWriter<'a> + Send + Sync,
{
    pub fn new(make_writer: W, min_level: LogLevel) -> Self {
        Self {
            make_writer,
            min_level,
        }
    }
}

impl<W> LogSink for JsonSink<W>
where
    W: for<'a> MakeWriter<'a> + Send + Sync,
{
    fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    fn handle(&self, _cx: &RequestContext, record: LogRecord) -> Result<(), LogError> {
        if !self.enabled(record.level()) {
            return Ok(());
        }

        let mut line = serde_json::to_vec(&record.to_json())?;
        line.push(b'\n');

        // One write per line keeps concurrent records from interleaving.
        let mut writer = self.make_writer.make_writer();
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }
}

impl<W> fmt::Debug for JsonSink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonSink")
            .field("min_level", &self.min_level)
            .finish_non_exhaustive()
    }
}

/// Adds the active trace id to every record before delegating to `inner`.
#[derive(Debug)]
pub struct TraceIdSink<S> {
    inner: S,
}

impl<S: LogSink> TraceIdSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: LogSink> LogSink for TraceIdSink<S> {
    fn enabled(&self, level: LogLevel) -> bool {
        self.inner.enabled(level)
    }

    fn handle(&self, cx: &RequestContext, mut record: LogRecord) -> Result<(), LogError> {
        let trace_id = cx.trace_id_hex().unwrap_or_else(|| NO_TRACE.to_string());
        record.remove(TRACE_ID_KEY);
        record.add(TRACE_ID_KEY, trace_id);
        self.inner.handle(cx, record)
    }
}
