use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Global labels attached to every record.
pub type Labels = BTreeMap<String, String>;

/// RFC 3339 timestamp for records.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Snapshot of an inbound HTTP request, independent of the web framework.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestInfo {
    pub method: String,
    /// Full URL including scheme, host and query string.
    pub url: String,
    pub path: String,
    /// Matched route template, when the router resolved one.
    pub route: Option<String>,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub ip: Option<String>,
    pub body: Option<String>,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            method: method.into(),
            url: path.clone(),
            path,
            ..Self::default()
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    /// Route template when known, else "unknown".
    pub fn route_or_unknown(&self) -> &str {
        self.route.as_deref().unwrap_or("unknown")
    }

    /// Query parameters as a JSON object; repeated keys collect into arrays.
    pub fn query_params(&self) -> serde_json::Map<String, Value> {
        let mut params = serde_json::Map::new();
        let Some(query) = self.query.as_deref() else {
            return params;
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = Value::String(value.into_owned());
            match params.get_mut(key.as_ref()) {
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    params.insert(key.into_owned(), value);
                }
            }
        }
        params
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl ResponseInfo {
    pub fn new(status: u16) -> Self {
        Self { status, ..Self::default() }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// An outbound HTTP call as seen before it is sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Id of the inbound request this call is made on behalf of.
    pub request_id: Option<String>,
}

impl OutboundRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self { method: method.into(), url: url.into(), ..Self::default() }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn host(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn path(&self) -> String {
        url::Url::parse(&self.url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| "/".to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundResponse {
    pub status: u16,
    pub body: Option<String>,
}

impl OutboundResponse {
    pub fn new(status: u16) -> Self {
        Self { status, body: None }
    }
}

/// A job lifecycle event emitted by the queue engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub job_name: String,
    pub queue: String,
    pub connection: String,
    pub attempts: u32,
    pub max_tries: Option<u32>,
    pub payload: Option<Value>,
}

impl JobEvent {
    pub fn new(job_id: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_name: job_name.into(),
            queue: "default".to_string(),
            connection: "default".to_string(),
            attempts: 1,
            ..Self::default()
        }
    }

    pub fn on(mut self, connection: impl Into<String>, queue: impl Into<String>) -> Self {
        self.connection = connection.into();
        self.queue = queue.into();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Correlates start and end events of one execution.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.connection, self.queue, self.job_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processed => "processed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub function: Option<String>,
    pub class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
}

impl StackFrame {
    pub fn new(function: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            file: Some(file.into()),
            line: Some(line),
            function: Some(function.into()),
            ..Self::default()
        }
    }
}

/// An error as the telemetry layer sees it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub class: String,
    /// Other class names this error counts as an instance of.
    pub lineage: Vec<String>,
    pub message: String,
    pub code: i64,
    pub file: String,
    pub line: u32,
    pub trace: Vec<StackFrame>,
    pub previous: Option<Box<ExceptionInfo>>,
}

impl ExceptionInfo {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self { class: class.into(), message: message.into(), ..Self::default() }
    }

    /// Build from any error, walking `source()` for the previous chain.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        let mut info = Self::new(std::any::type_name::<E>(), err.to_string());
        info.previous = err.source().map(|source| Box::new(Self::from_source(source)));
        info
    }

    fn from_source(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut info = Self::new("Error", err.to_string());
        info.previous = err.source().map(|source| Box::new(Self::from_source(source)));
        info
    }

    /// A panic captured by the host, with the payload message.
    pub fn panic(message: impl Into<String>) -> Self {
        Self::new("panic", message)
    }

    pub fn at(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = file.into();
        self.line = line;
        self
    }

    pub fn with_lineage<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lineage = classes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = code;
        self
    }

    pub fn with_trace(mut self, trace: Vec<StackFrame>) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_previous(mut self, previous: ExceptionInfo) -> Self {
        self.previous = Some(Box::new(previous));
        self
    }

    pub fn is_instance_of(&self, class: &str) -> bool {
        self.class == class || self.lineage.iter().any(|c| c == class)
    }

    /// Class name without its module path.
    pub fn class_basename(&self) -> &str {
        basename(&self.class)
    }

    pub fn file_basename(&self) -> &str {
        self.file.rsplit(['/', '\\']).next().unwrap_or(&self.file)
    }
}

fn basename(class: &str) -> &str {
    let tail = class.rsplit("::").next().unwrap_or(class);
    tail.rsplit('\\').next().unwrap_or(tail)
}

#[derive(Debug, Clone, Serialize)]
pub struct InboundRecord {
    pub method: String,
    pub uri: String,
    pub route: String,
    pub status_code: u16,
    /// Seconds.
    pub duration: f64,
    /// Resident memory delta in bytes.
    pub memory: i64,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub labels: Labels,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundRecord {
    pub method: String,
    pub host: String,
    pub path: String,
    pub full_url: String,
    /// 0 when the call failed before a response arrived.
    pub status_code: u16,
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub labels: Labels,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub job_name: String,
    pub queue: String,
    pub connection: String,
    pub status: JobStatus,
    pub duration: f64,
    pub attempts: u32,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<JobFailure>,
    pub labels: Labels,
}

/// The error a failed job ended with, as carried on its record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub class: String,
    pub message: String,
    pub file: String,
    pub line: u32,
}

impl From<&ExceptionInfo> for JobFailure {
    fn from(exception: &ExceptionInfo) -> Self {
        Self {
            class: exception.class.clone(),
            message: exception.message.clone(),
            file: exception.file.clone(),
            line: exception.line,
        }
    }
}
