//! Structured log writers and the channels they write to.
//!
//! Writers build verbose records (bodies, traces, request and user context),
//! mask them and hand them to a named channel. Unregistered channel names fall
//! back to `tracing` events, which the subscriber from `logging` routes to the
//! console and the JSON log file.

pub mod exception;
pub mod inbound;
pub mod job;
pub mod outbound;

pub use exception::ExceptionLogger;
pub use inbound::InboundRequestLogger;
pub use job::JobLogger;
pub use outbound::OutboundRequestLogger;

use crate::masker::SensitiveDataMasker;
use crate::types::StackFrame;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::Level;

/// A named destination for structured log records.
pub trait LogChannel: Send + Sync {
    fn write(&self, level: Level, message: &str, record: &Value);
}

/// Emits each record as a `tracing` event carrying the channel name.
#[derive(Debug, Clone)]
pub struct TracingChannel {
    name: String,
}

impl TracingChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl LogChannel for TracingChannel {
    fn write(&self, level: Level, message: &str, record: &Value) {
        emit(&self.name, level, message, record);
    }
}

fn emit(channel: &str, level: Level, message: &str, record: &Value) {
    match level {
        Level::ERROR => tracing::error!(channel, record = %record, "{}", message),
        Level::WARN => tracing::warn!(channel, record = %record, "{}", message),
        Level::DEBUG | Level::TRACE => tracing::debug!(channel, record = %record, "{}", message),
        _ => tracing::info!(channel, record = %record, "{}", message),
    }
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub level: Level,
    pub message: String,
    pub record: Value,
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    lines: Mutex<Vec<LogLine>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<LogLine> {
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.lines().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogChannel for MemoryChannel {
    fn write(&self, level: Level, message: &str, record: &Value) {
        let line = LogLine { level, message: message.to_string(), record: record.clone() };
        match self.lines.lock() {
            Ok(mut lines) => lines.push(line),
            Err(poisoned) => poisoned.into_inner().push(line),
        }
    }
}

/// Resolves channel names to channels.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<dyn LogChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, channel: Arc<dyn LogChannel>) {
        let mut channels = match self.channels.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels.insert(name.into(), channel);
    }

    /// The channel registered under `name`, if any.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn LogChannel>> {
        let channels = match self.channels.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels.get(name).cloned()
    }

    /// Unregistered channels go straight to `tracing`.
    pub fn write(&self, channel: &str, level: Level, message: &str, record: &Value) {
        match self.resolve(channel) {
            Some(registered) => registered.write(level, message, record),
            None => emit(channel, level, message, record),
        }
    }
}

/// A body as it appears in a record: masked JSON when it parses, otherwise
/// the raw text capped at `max_size` bytes. Empty bodies are omitted.
pub(crate) fn body_value(masker: &SensitiveDataMasker, body: Option<&str>, max_size: usize) -> Option<Value> {
    let body = body?;
    if body.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(body) {
        Ok(parsed) => Some(masker.mask_value(&parsed)),
        Err(_) => Some(Value::String(masker.truncate(body, max_size))),
    }
}

/// Label value safe for log aggregators such as Loki.
pub(crate) fn sanitize_log_label(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub(crate) fn bytes_to_mb(bytes: u64) -> f64 {
    round2(bytes as f64 / 1024.0 / 1024.0)
}

/// At most `max_frames` frames, with placeholders for missing locations.
pub(crate) fn format_trace(trace: &[StackFrame], max_frames: usize, with_args: bool) -> Vec<Value> {
    trace
        .iter()
        .take(max_frames)
        .map(|frame| {
            let mut entry = json!({
                "file": frame.file.as_deref().unwrap_or("unknown"),
                "line": frame.line.unwrap_or(0),
                "function": frame.function.as_deref().unwrap_or("unknown"),
            });
            if let Some(class) = &frame.class {
                entry["class"] = json!(class);
            }
            if with_args {
                if let Some(args) = &frame.args {
                    entry["args"] = Value::Array(args.iter().map(format_argument).collect());
                }
            }
            entry
        })
        .collect()
}

const MAX_ARGUMENT_LEN: usize = 100;

fn format_argument(arg: &Value) -> Value {
    let text = match arg {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => format!("[array:{}]", items.len()),
        Value::Object(map) => format!("[object:{}]", map.len()),
        Value::String(s) if s.len() > MAX_ARGUMENT_LEN => {
            let mut end = MAX_ARGUMENT_LEN;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &s[..end])
        }
        Value::String(s) => s.clone(),
    };
    Value::String(text)
}
