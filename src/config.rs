use crate::constants::*;
use crate::error::{ObservatoryError, Result};
use crate::types::JobStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Which exporter strategy backs the metrics path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExporterKind {
    /// Pull model: in-process registry scraped through the metrics endpoint.
    #[default]
    #[serde(alias = "prometheus")]
    Registry,
    /// Push model: buffered batches delivered to a remote ingest API.
    #[serde(alias = "sidmonitor")]
    Push,
}

/// Storage behind the registry exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Series live in this process only.
    #[default]
    Memory,
    /// Series live in a Redis database shared by every process scraping it.
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservatoryConfig {
    pub enabled: bool,
    pub app_name: String,
    pub exporter: ExporterKind,
    /// Channel used by every log writer that does not name its own.
    pub log_channel: String,
    /// Attached to every record and every buffered push entry.
    pub labels: BTreeMap<String, String>,
    pub masking: MaskingConfig,
    pub request_id: RequestIdConfig,
    pub inbound: InboundConfig,
    pub inbound_logger: InboundLogConfig,
    pub outbound: OutboundConfig,
    pub outbound_logger: OutboundLogConfig,
    pub jobs: JobsConfig,
    pub job_logger: JobLogConfig,
    pub exceptions: ExceptionsConfig,
    pub exception_logger: ExceptionLogConfig,
    pub prometheus: PrometheusConfig,
    pub push: PushConfig,
    pub tracking: TrackingConfig,
}

impl Default for ObservatoryConfig {
    fn default() -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("environment".to_string(), "production".to_string());

        Self {
            enabled: true,
            app_name: "app".to_string(),
            exporter: ExporterKind::Registry,
            log_channel: DEFAULT_LOG_CHANNEL.to_string(),
            labels,
            masking: MaskingConfig::default(),
            request_id: RequestIdConfig::default(),
            inbound: InboundConfig::default(),
            inbound_logger: InboundLogConfig::default(),
            outbound: OutboundConfig::default(),
            outbound_logger: OutboundLogConfig::default(),
            jobs: JobsConfig::default(),
            job_logger: JobLogConfig::default(),
            exceptions: ExceptionsConfig::default(),
            exception_logger: ExceptionLogConfig::default(),
            prometheus: PrometheusConfig::default(),
            push: PushConfig::default(),
            tracking: TrackingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingConfig {
    pub enabled: bool,
    pub fields: Vec<String>,
    pub replacement: String,
    pub exclude_headers: Vec<String>,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fields: strings(&[
                "password",
                "password_confirmation",
                "token",
                "secret",
                "api_key",
                "credit_card",
                "cvv",
            ]),
            replacement: DEFAULT_MASK_REPLACEMENT.to_string(),
            exclude_headers: strings(&["authorization", "cookie", "set-cookie", "x-api-key", "x-csrf-token"]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestIdConfig {
    pub enabled: bool,
    pub header: String,
    pub generate_if_missing: bool,
    pub include_in_log_context: bool,
    pub include_in_response: bool,
}

impl Default for RequestIdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            header: DEFAULT_REQUEST_ID_HEADER.to_string(),
            generate_if_missing: true,
            include_in_log_context: true,
            include_in_response: true,
        }
    }
}

/// Inbound metrics collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundConfig {
    pub enabled: bool,
    pub methods: Vec<String>,
    /// Glob patterns matched against the request path (no leading slash).
    pub exclude_paths: Vec<String>,
    pub record_body: bool,
    pub max_body_size: usize,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            methods: strings(&["GET", "POST", "PUT", "PATCH", "DELETE"]),
            exclude_paths: default_exclude_paths(),
            record_body: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundLogConfig {
    pub enabled: bool,
    pub channel: Option<String>,
    pub exclude_paths: Vec<String>,
    /// Only log requests at least this slow; 0 logs everything.
    pub slow_threshold_ms: u64,
    /// Only log these status codes; empty logs every status.
    pub status_codes: Vec<u16>,
    pub log_headers: bool,
    pub log_body: bool,
    pub log_response_body: bool,
    pub max_body_size: usize,
    /// Header name -> field name copied onto the record.
    pub custom_headers: BTreeMap<String, String>,
    pub max_query_items: usize,
    pub max_query_depth: usize,
}

impl Default for InboundLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: None,
            exclude_paths: default_exclude_paths(),
            slow_threshold_ms: 0,
            status_codes: Vec::new(),
            log_headers: false,
            log_body: false,
            log_response_body: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            custom_headers: BTreeMap::new(),
            max_query_items: 50,
            max_query_depth: 3,
        }
    }
}

/// Outbound metrics collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    pub enabled: bool,
    pub exclude_hosts: Vec<String>,
    pub record_body: bool,
    pub max_body_size: usize,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exclude_hosts: strings(&["localhost", "127.0.0.1"]),
            record_body: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundLogConfig {
    pub enabled: bool,
    pub channel: Option<String>,
    pub exclude_hosts: Vec<String>,
    pub slow_threshold_ms: u64,
    pub status_codes: Vec<u16>,
    pub log_body: bool,
    pub max_body_size: usize,
    /// Host pattern -> service name.
    pub services: BTreeMap<String, String>,
}

impl Default for OutboundLogConfig {
    fn default() -> Self {
        let services = [
            ("*.stripe.com", "stripe"),
            ("*.amazonaws.com", "aws"),
            ("*.sendgrid.com", "sendgrid"),
            ("*.twilio.com", "twilio"),
            ("*.slack.com", "slack"),
            ("*.sentry.io", "sentry"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            enabled: true,
            channel: None,
            exclude_hosts: strings(&["localhost", "127.0.0.1"]),
            slow_threshold_ms: 0,
            status_codes: Vec::new(),
            log_body: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            services,
        }
    }
}

/// Job metrics collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub enabled: bool,
    pub exclude_jobs: Vec<String>,
    pub record_payload: bool,
    pub max_payload_size: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exclude_jobs: Vec::new(),
            record_payload: false,
            max_payload_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobLogConfig {
    pub enabled: bool,
    pub channel: Option<String>,
    pub exclude_jobs: Vec<String>,
    pub only_statuses: Vec<JobStatus>,
    pub slow_threshold_ms: u64,
    pub log_payload: bool,
    pub max_payload_size: usize,
    pub log_memory: bool,
    pub log_stack_trace: bool,
    pub max_stack_frames: usize,
    pub labels: BTreeMap<String, String>,
}

impl Default for JobLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: None,
            exclude_jobs: Vec::new(),
            only_statuses: Vec::new(),
            slow_threshold_ms: 0,
            log_payload: false,
            max_payload_size: DEFAULT_MAX_BODY_SIZE,
            log_memory: true,
            log_stack_trace: false,
            max_stack_frames: 10,
            labels: BTreeMap::new(),
        }
    }
}

/// Exception metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExceptionsConfig {
    pub enabled: bool,
    /// Class names; an exception is ignored when it is an instance of any.
    pub ignore: Vec<String>,
}

impl Default for ExceptionsConfig {
    fn default() -> Self {
        Self { enabled: true, ignore: strings(&DEFAULT_IGNORED_EXCEPTIONS) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExceptionLogConfig {
    pub enabled: bool,
    pub channel: Option<String>,
    pub ignore: Vec<String>,
    /// Glob patterns matched against the exception class name.
    pub ignore_patterns: Vec<String>,
    pub log_request_context: bool,
    pub log_request_headers: bool,
    pub log_request_body: bool,
    pub log_user: bool,
    pub log_stack_trace: bool,
    pub max_stack_frames: usize,
    pub log_arguments: bool,
    pub log_previous: bool,
    pub max_previous_depth: usize,
    pub log_memory: bool,
    pub critical_exceptions: Vec<String>,
    pub warning_exceptions: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

impl Default for ExceptionLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: None,
            ignore: Vec::new(),
            ignore_patterns: Vec::new(),
            log_request_context: true,
            log_request_headers: false,
            log_request_body: false,
            log_user: true,
            log_stack_trace: true,
            max_stack_frames: 20,
            log_arguments: false,
            log_previous: true,
            max_previous_depth: 3,
            log_memory: true,
            critical_exceptions: strings(&["panic"]),
            warning_exceptions: Vec::new(),
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrometheusConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub storage: StorageKind,
    /// Only read when `storage` is `redis`.
    pub redis: RedisConfig,
    pub buckets: Vec<f64>,
    pub auth: BasicAuthConfig,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: DEFAULT_METRICS_ENDPOINT.to_string(),
            storage: StorageKind::Memory,
            redis: RedisConfig::default(),
            buckets: DEFAULT_BUCKETS.to_vec(),
            auth: BasicAuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: i64,
    /// Key prefix for every series and metadata key.
    pub prefix: String,
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            database: DEFAULT_REDIS_DATABASE,
            prefix: DEFAULT_REDIS_PREFIX.to_string(),
            timeout_ms: DEFAULT_REDIS_TIMEOUT_MS,
        }
    }
}

impl RedisConfig {
    /// Connection URL. A blank password is left out so no AUTH is sent.
    pub fn url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&format!("redis://{}:{}/{}", self.host, self.port, self.database))
            .map_err(|e| ObservatoryError::Config(format!("Invalid redis address '{}': {}", self.host, e)))?;
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            url.set_password(Some(password))
                .map_err(|_| ObservatoryError::Config("Redis password cannot be set on this address".into()))?;
        }
        Ok(url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicAuthConfig {
    pub enabled: bool,
    pub username: String,
    pub password: String,
}

impl Default for BasicAuthConfig {
    fn default() -> Self {
        Self { enabled: false, username: "prometheus".to_string(), password: String::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub project_id: String,
    pub batch_size: usize,
    pub batch_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_PUSH_ENDPOINT.to_string(),
            api_key: None,
            project_id: String::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_interval_secs: DEFAULT_BATCH_INTERVAL_SECS,
            timeout_secs: DEFAULT_PUSH_TIMEOUT_SECS,
        }
    }
}

impl PushConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs(self.batch_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The key only counts when it is non-blank.
    pub fn credential(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }
}

/// Bounds the start-time map of in-flight jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self { ttl_secs: DEFAULT_TRACKING_TTL_SECS, sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS }
    }
}

impl ObservatoryConfig {
    /// Read `path` as TOML, apply `OBSERVATORY_*` overrides from the environment
    /// (including a `.env` file when present) and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ObservatoryError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;

        let mut config: ObservatoryConfig = toml::from_str(&content)?;
        dotenv::dotenv().ok();
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for hosts without a config file.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut config = ObservatoryConfig::default();
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides using `lookup` to resolve variable names.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |name: &str| lookup(name).and_then(|v| parse_bool(&v));

        if let Some(v) = flag("OBSERVATORY_ENABLED") {
            self.enabled = v;
        }
        if let Some(v) = lookup("OBSERVATORY_APP_NAME").or_else(|| lookup("APP_NAME")) {
            self.app_name = v;
        }
        if let Some(v) = lookup("APP_ENV") {
            self.labels.insert("environment".to_string(), v);
        }
        if let Some(v) = lookup("OBSERVATORY_EXPORTER") {
            match v.trim().to_ascii_lowercase().as_str() {
                "registry" | "prometheus" => self.exporter = ExporterKind::Registry,
                "push" | "sidmonitor" => self.exporter = ExporterKind::Push,
                other => tracing::warn!("Ignoring unknown OBSERVATORY_EXPORTER value '{}'", other),
            }
        }
        if let Some(v) = lookup("OBSERVATORY_LOG_CHANNEL") {
            self.log_channel = v;
        }
        if let Some(v) = flag("OBSERVATORY_INBOUND_ENABLED") {
            self.inbound.enabled = v;
        }
        if let Some(v) = flag("OBSERVATORY_LOG_BODY") {
            self.inbound_logger.log_body = v;
        }
        if let Some(v) = lookup("OBSERVATORY_SLOW_THRESHOLD_MS").and_then(|v| v.parse().ok()) {
            self.inbound_logger.slow_threshold_ms = v;
        }
        if let Some(v) = flag("OBSERVATORY_OUTBOUND_ENABLED") {
            self.outbound.enabled = v;
        }
        if let Some(v) = flag("OBSERVATORY_OUTBOUND_LOG_BODY") {
            self.outbound_logger.log_body = v;
        }
        if let Some(v) = lookup("OBSERVATORY_OUTBOUND_SLOW_THRESHOLD_MS").and_then(|v| v.parse().ok()) {
            self.outbound_logger.slow_threshold_ms = v;
        }
        if let Some(v) = flag("OBSERVATORY_JOBS_ENABLED") {
            self.jobs.enabled = v;
        }
        if let Some(v) = flag("OBSERVATORY_JOB_LOGGER_ENABLED") {
            self.job_logger.enabled = v;
        }
        if let Some(v) = flag("OBSERVATORY_EXCEPTIONS_ENABLED") {
            self.exceptions.enabled = v;
        }
        if let Some(v) = flag("OBSERVATORY_EXCEPTION_LOGGER_ENABLED") {
            self.exception_logger.enabled = v;
        }
        if let Some(v) = flag("OBSERVATORY_PROMETHEUS_ENABLED") {
            self.prometheus.enabled = v;
        }
        if let Some(v) = lookup("OBSERVATORY_PROMETHEUS_STORAGE") {
            match v.trim().to_ascii_lowercase().as_str() {
                "memory" => self.prometheus.storage = StorageKind::Memory,
                "redis" => self.prometheus.storage = StorageKind::Redis,
                other => tracing::warn!("Ignoring unknown OBSERVATORY_PROMETHEUS_STORAGE value '{}'", other),
            }
        }
        if let Some(v) = lookup("REDIS_HOST") {
            self.prometheus.redis.host = v;
        }
        if let Some(v) = lookup("REDIS_PORT").and_then(|v| v.parse().ok()) {
            self.prometheus.redis.port = v;
        }
        if let Some(v) = lookup("REDIS_PASSWORD") {
            self.prometheus.redis.password = Some(v);
        }
        if let Some(v) = lookup("OBSERVATORY_REDIS_DB").and_then(|v| v.parse().ok()) {
            self.prometheus.redis.database = v;
        }
        if let Some(v) = flag("OBSERVATORY_METRICS_AUTH") {
            self.prometheus.auth.enabled = v;
        }
        if let Some(v) = lookup("OBSERVATORY_METRICS_USER") {
            self.prometheus.auth.username = v;
        }
        if let Some(v) = lookup("OBSERVATORY_METRICS_PASS") {
            self.prometheus.auth.password = v;
        }
        if let Some(v) = lookup("OBSERVATORY_PUSH_ENDPOINT") {
            self.push.endpoint = v;
        }
        if let Some(v) = lookup("OBSERVATORY_API_KEY") {
            self.push.api_key = Some(v);
        }
        if let Some(v) = lookup("OBSERVATORY_PROJECT_ID") {
            self.push.project_id = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.prometheus.buckets.is_empty() {
            return Err(ObservatoryError::Config("prometheus.buckets must not be empty".into()));
        }
        if self.prometheus.buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ObservatoryError::Config(
                "prometheus.buckets must be strictly increasing".into(),
            ));
        }
        if !self.prometheus.endpoint.starts_with('/') {
            return Err(ObservatoryError::Config(format!(
                "prometheus.endpoint '{}' must start with '/'",
                self.prometheus.endpoint
            )));
        }
        if self.push.batch_size == 0 {
            return Err(ObservatoryError::Config("push.batch_size must be at least 1".into()));
        }
        if self.push.timeout_secs == 0 {
            return Err(ObservatoryError::Config("push.timeout_secs must be at least 1".into()));
        }
        if self.exporter == ExporterKind::Push {
            url::Url::parse(&self.push.endpoint).map_err(|e| {
                ObservatoryError::Config(format!("push.endpoint '{}' is not a URL: {}", self.push.endpoint, e))
            })?;
        }
        if self.request_id.header.trim().is_empty() {
            return Err(ObservatoryError::Config("request_id.header must not be empty".into()));
        }
        if self.tracking.ttl_secs == 0 {
            return Err(ObservatoryError::Config("tracking.ttl_secs must be at least 1".into()));
        }
        Ok(())
    }

    /// The channel a writer uses when it has none of its own.
    pub fn channel_or_default<'a>(&'a self, channel: &'a Option<String>) -> &'a str {
        channel.as_deref().unwrap_or(&self.log_channel)
    }

    pub fn environment(&self) -> Option<&str> {
        self.labels.get("environment").map(String::as_str)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn default_exclude_paths() -> Vec<String> {
    strings(&["telescope*", "horizon*", "_debugbar*", "health", "metrics", "favicon.ico"])
}
