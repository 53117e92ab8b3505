use crate::config::{ObservatoryConfig, OutboundLogConfig};
use crate::loggers::{body_value, round2, ChannelRegistry};
use crate::masker::SensitiveDataMasker;
use crate::patterns::PatternSet;
use crate::types::{ExceptionInfo, OutboundRequest, OutboundResponse};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

pub const OUTBOUND_MESSAGE: &str = "HTTP_OUTBOUND";

/// Writes one record per outbound call.
pub struct OutboundRequestLogger {
    enabled: bool,
    config: OutboundLogConfig,
    channel: String,
    environment: Option<String>,
    exclude_hosts: PatternSet,
    services: Vec<(PatternSet, String)>,
    masker: Arc<SensitiveDataMasker>,
    channels: Arc<ChannelRegistry>,
}

impl OutboundRequestLogger {
    pub fn new(config: &ObservatoryConfig, masker: Arc<SensitiveDataMasker>, channels: Arc<ChannelRegistry>) -> Self {
        let logger = &config.outbound_logger;
        let services = logger
            .services
            .iter()
            .map(|(pattern, name)| (PatternSet::case_insensitive([pattern]), name.clone()))
            .collect();

        Self {
            enabled: config.enabled && logger.enabled,
            config: logger.clone(),
            channel: config.channel_or_default(&logger.channel).to_string(),
            environment: config.environment().map(str::to_string),
            exclude_hosts: PatternSet::case_insensitive(&logger.exclude_hosts),
            services,
            masker,
            channels,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Body size limit when bodies to `host` are logged.
    pub fn body_limit(&self, host: &str) -> Option<usize> {
        (self.enabled && self.config.log_body && !self.exclude_hosts.matches(host)).then_some(self.config.max_body_size)
    }

    pub fn should_log(&self, host: &str, response: Option<&OutboundResponse>, duration: Duration) -> bool {
        if self.exclude_hosts.matches(host) {
            return false;
        }
        let threshold = self.config.slow_threshold_ms;
        if threshold > 0 && duration < Duration::from_millis(threshold) {
            return false;
        }
        if !self.config.status_codes.is_empty() {
            let status = response.map(|r| r.status).unwrap_or(0);
            if !self.config.status_codes.contains(&status) {
                return false;
            }
        }
        true
    }

    pub fn log(
        &self,
        request: &OutboundRequest,
        response: Option<&OutboundResponse>,
        duration: Duration,
        error: Option<&ExceptionInfo>,
    ) {
        if !self.enabled || !self.should_log(&request.host(), response, duration) {
            return;
        }

        let record = self.build_record(request, response, duration, error);
        let failed = error.is_some() || response.map(|r| r.status >= 400).unwrap_or(false);
        let level = if failed { Level::ERROR } else { Level::INFO };
        self.channels.write(&self.channel, level, OUTBOUND_MESSAGE, &record);
    }

    pub fn build_record(
        &self,
        request: &OutboundRequest,
        response: Option<&OutboundResponse>,
        duration: Duration,
        error: Option<&ExceptionInfo>,
    ) -> Value {
        let host = request.host();
        let mut record = json!({
            "request_id": request.request_id,
            "type": "outbound",
            "service": self.detect_service(&host),
            "method": request.method,
            "url": request.url,
            "host": host,
            "path": request.path(),
            "status_code": response.map(|r| r.status).unwrap_or(0),
            "duration_ms": round2(duration.as_secs_f64() * 1000.0),
            "environment": self.environment,
        });

        if let Some(error) = error {
            record["error"] = json!({ "class": error.class, "message": error.message });
        }

        if self.config.log_body {
            let max = self.config.max_body_size;
            record["request_body"] = body_value(&self.masker, request.body.as_deref(), max).unwrap_or(Value::Null);
            if let Some(response) = response {
                record["response_body"] =
                    body_value(&self.masker, response.body.as_deref(), max).unwrap_or(Value::Null);
            }
        }

        record
    }

    /// Service name from the configured host patterns, else the second-level
    /// domain label (`api.stripe.com` -> `stripe`).
    pub fn detect_service(&self, host: &str) -> String {
        if let Some((_, name)) = self.services.iter().find(|(pattern, _)| pattern.matches(host)) {
            return name.clone();
        }
        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() >= 2 {
            return labels[labels.len() - 2].to_string();
        }
        host.to_string()
    }
}
