use crate::collectors::timing::{peak_memory_bytes, resident_memory_bytes};
use crate::config::{InboundLogConfig, ObservatoryConfig};
use crate::loggers::{body_value, bytes_to_mb, round2, ChannelRegistry};
use crate::masker::SensitiveDataMasker;
use crate::patterns::PatternSet;
use crate::types::{RequestInfo, ResponseInfo};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

pub const INBOUND_MESSAGE: &str = "HTTP_REQUEST";

/// Writes one record per completed inbound request.
pub struct InboundRequestLogger {
    enabled: bool,
    config: InboundLogConfig,
    channel: String,
    environment: Option<String>,
    exclude_paths: PatternSet,
    masker: Arc<SensitiveDataMasker>,
    channels: Arc<ChannelRegistry>,
}

impl InboundRequestLogger {
    pub fn new(config: &ObservatoryConfig, masker: Arc<SensitiveDataMasker>, channels: Arc<ChannelRegistry>) -> Self {
        let logger = &config.inbound_logger;
        Self {
            enabled: config.enabled && logger.enabled,
            config: logger.clone(),
            channel: config.channel_or_default(&logger.channel).to_string(),
            environment: config.environment().map(str::to_string),
            exclude_paths: PatternSet::new(&logger.exclude_paths),
            masker,
            channels,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn captures_request_body(&self) -> bool {
        self.enabled && self.config.log_body
    }

    pub fn captures_response_body(&self) -> bool {
        self.enabled && self.config.log_response_body
    }

    /// Zero when no body is logged.
    pub fn body_limit(&self) -> usize {
        if self.captures_request_body() || self.captures_response_body() {
            self.config.max_body_size
        } else {
            0
        }
    }

    pub fn should_log(&self, request: &RequestInfo, response: &ResponseInfo, duration: Duration) -> bool {
        if self.exclude_paths.matches_path(&request.path) {
            return false;
        }
        let threshold = self.config.slow_threshold_ms;
        if threshold > 0 && duration < Duration::from_millis(threshold) {
            return false;
        }
        if !self.config.status_codes.is_empty() && !self.config.status_codes.contains(&response.status) {
            return false;
        }
        true
    }

    pub fn log(&self, request: &RequestInfo, response: &ResponseInfo, duration: Duration) {
        if !self.enabled || !self.should_log(request, response, duration) {
            return;
        }

        let record = self.build_record(request, response, duration);
        let level = if response.status >= 500 { Level::ERROR } else { Level::INFO };
        self.channels.write(&self.channel, level, INBOUND_MESSAGE, &record);
    }

    pub fn build_record(&self, request: &RequestInfo, response: &ResponseInfo, duration: Duration) -> Value {
        let memory = peak_memory_bytes().or_else(resident_memory_bytes).unwrap_or(0);

        let mut record = json!({
            "request_id": request.request_id,
            "type": "inbound",
            "method": request.method,
            "url": request.url,
            "path": request.path,
            "route": request.route_or_unknown(),
            "status_code": response.status,
            "duration_ms": round2(duration.as_secs_f64() * 1000.0),
            "ip": request.ip,
            "user_agent": request.user_agent(),
            "memory_mb": bytes_to_mb(memory),
        });

        if let Some(user_id) = &request.user_id {
            record["user_id"] = json!(user_id);
        }

        for (header, field) in &self.config.custom_headers {
            if let Some(value) = request.header(header) {
                record[field.as_str()] = json!(value);
            }
        }

        if self.config.log_headers {
            record["headers"] = Value::Object(self.masker.filter_headers(request.headers.iter().map(|(k, v)| (k, v))));
        }

        if self.config.log_body {
            record["request_body"] =
                body_value(&self.masker, request.body.as_deref(), self.config.max_body_size).unwrap_or(Value::Null);
        }

        if self.config.log_response_body {
            record["response_body"] =
                body_value(&self.masker, response.body.as_deref(), self.config.max_body_size).unwrap_or(Value::Null);
        }

        let query = request.query_params();
        if !query.is_empty() {
            let normalized =
                self.masker.normalize(&Value::Object(query), self.config.max_query_items, self.config.max_query_depth);
            record["query_params"] = self.masker.mask_value(&normalized);
        }

        record["environment"] = json!(self.environment);
        record
    }
}
