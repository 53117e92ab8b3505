use crate::collectors::timing::{peak_memory_bytes, resident_memory_bytes};
use crate::config::{ExceptionLogConfig, ObservatoryConfig};
use crate::loggers::{bytes_to_mb, format_trace, sanitize_log_label, ChannelRegistry};
use crate::masker::SensitiveDataMasker;
use crate::patterns::PatternSet;
use crate::types::{now_rfc3339, ExceptionInfo, RequestInfo};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::Level;

pub const EXCEPTION_MESSAGE: &str = "EXCEPTION";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// Writes unhandled errors with request, user and trace context.
pub struct ExceptionLogger {
    enabled: bool,
    config: ExceptionLogConfig,
    channel: String,
    ignore_patterns: PatternSet,
    masker: Arc<SensitiveDataMasker>,
    channels: Arc<ChannelRegistry>,
}

impl ExceptionLogger {
    pub fn new(config: &ObservatoryConfig, masker: Arc<SensitiveDataMasker>, channels: Arc<ChannelRegistry>) -> Self {
        let logger = &config.exception_logger;
        Self {
            enabled: config.enabled && logger.enabled,
            config: logger.clone(),
            channel: config.channel_or_default(&logger.channel).to_string(),
            ignore_patterns: PatternSet::new(&logger.ignore_patterns),
            masker,
            channels,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn should_log(&self, exception: &ExceptionInfo) -> bool {
        if self.config.ignore.iter().any(|class| exception.is_instance_of(class)) {
            return false;
        }
        !self.ignore_patterns.matches(&exception.class)
    }

    pub fn severity(&self, exception: &ExceptionInfo) -> Severity {
        if self.config.critical_exceptions.iter().any(|c| exception.is_instance_of(c)) {
            Severity::Critical
        } else if self.config.warning_exceptions.iter().any(|c| exception.is_instance_of(c)) {
            Severity::Warning
        } else {
            Severity::Error
        }
    }

    pub fn log(&self, exception: &ExceptionInfo, context: &Map<String, Value>, request: Option<&RequestInfo>) {
        if !self.enabled || !self.should_log(exception) {
            return;
        }
        let record = self.build_record(exception, context, request);
        self.channels.write(&self.channel, Level::ERROR, EXCEPTION_MESSAGE, &record);
    }

    pub fn build_record(
        &self,
        exception: &ExceptionInfo,
        context: &Map<String, Value>,
        request: Option<&RequestInfo>,
    ) -> Value {
        let mut record = json!({
            "request_id": request.and_then(|r| r.request_id.as_deref()),
            "exception_class": exception.class,
            "message": exception.message,
            "code": exception.code,
            "file": exception.file,
            "line": exception.line,
            "timestamp": now_rfc3339(),
        });

        if self.config.log_request_context {
            if let Some(request) = request {
                record["request"] = self.request_context(request);
            }
        }

        if self.config.log_user {
            if let Some(user) = request.and_then(user_context) {
                record["user"] = user;
            }
        }

        if self.config.log_stack_trace {
            record["trace"] =
                Value::Array(format_trace(&exception.trace, self.config.max_stack_frames, self.config.log_arguments));
        }

        if self.config.log_previous && self.config.max_previous_depth > 0 {
            if let Some(previous) = &exception.previous {
                record["previous"] = format_previous(previous, self.config.max_previous_depth);
            }
        }

        if !context.is_empty() {
            record["context"] = Value::Object(self.masker.mask(context));
        }

        if self.config.log_memory {
            record["memory"] = json!({
                "used_mb": bytes_to_mb(resident_memory_bytes().unwrap_or(0)),
                "peak_mb": bytes_to_mb(peak_memory_bytes().unwrap_or(0)),
            });
        }

        let mut labels = self.config.labels.clone();
        labels.insert("exception_class".into(), sanitize_log_label(exception.class_basename()));
        labels.insert("severity".into(), self.severity(exception).as_str().to_string());
        record["labels"] = json!(labels);

        record
    }

    fn request_context(&self, request: &RequestInfo) -> Value {
        let mut context = json!({
            "method": request.method,
            "url": request.url,
            "path": request.path,
            "ip": request.ip,
            "user_agent": request.user_agent(),
        });
        if let Some(route) = &request.route {
            context["route"] = json!(route);
        }
        if self.config.log_request_headers {
            context["headers"] =
                Value::Object(self.masker.filter_headers(request.headers.iter().map(|(k, v)| (k, v))));
        }
        if self.config.log_request_body {
            if let Some(body) = request.body.as_deref().filter(|b| !b.is_empty()) {
                context["body"] = match serde_json::from_str::<Value>(body) {
                    Ok(parsed) => self.masker.mask_value(&parsed),
                    Err(_) => Value::String(self.masker.truncate(body, crate::constants::DEFAULT_MAX_BODY_SIZE)),
                };
            }
        }
        context
    }
}

fn user_context(request: &RequestInfo) -> Option<Value> {
    let id = request.user_id.as_ref()?;
    let mut user = json!({ "id": id });
    if let Some(workspace) = request.header("X-Workspace-Id") {
        user["workspace_id"] = json!(workspace);
    }
    Some(user)
}

/// The previous chain, at most `remaining` levels deep.
fn format_previous(exception: &ExceptionInfo, remaining: usize) -> Value {
    let mut data = json!({
        "class": exception.class,
        "message": exception.message,
        "code": exception.code,
        "file": exception.file,
        "line": exception.line,
    });
    if remaining > 1 {
        if let Some(previous) = &exception.previous {
            data["previous"] = format_previous(previous, remaining - 1);
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loggers::MemoryChannel;

    fn setup(adjust: impl FnOnce(&mut ObservatoryConfig)) -> (ExceptionLogger, Arc<MemoryChannel>) {
        let mut config = ObservatoryConfig::default();
        config.exception_logger.enabled = true;
        adjust(&mut config);
        let channels = Arc::new(ChannelRegistry::new());
        let memory = Arc::new(MemoryChannel::new());
        channels.register(config.log_channel.clone(), memory.clone());
        let logger = ExceptionLogger::new(&config, Arc::new(SensitiveDataMasker::default()), channels);
        (logger, memory)
    }

    fn chain(depth: usize) -> ExceptionInfo {
        let mut current = ExceptionInfo::new("Level0", "root cause");
        for level in 1..depth {
            current = ExceptionInfo::new(format!("Level{}", level), "wrapped").with_previous(current);
        }
        current
    }

    fn chain_len(value: &Value) -> usize {
        let mut len = 0;
        let mut node = value;
        while node.is_object() {
            len += 1;
            node = &node["previous"];
        }
        len
    }

    #[test]
    fn test_severity_priority() {
        let (logger, _) = setup(|c| {
            c.exception_logger.critical_exceptions = vec!["db::Fatal".into()];
            c.exception_logger.warning_exceptions = vec!["db::Error".into(), "auth::Denied".into()];
        });

        let both = ExceptionInfo::new("db::Fatal", "x").with_lineage(["db::Error"]);
        assert_eq!(logger.severity(&both), Severity::Critical);
        assert_eq!(logger.severity(&ExceptionInfo::new("auth::Denied", "x")), Severity::Warning);
        assert_eq!(logger.severity(&ExceptionInfo::new("io::Error", "x")), Severity::Error);
        assert_eq!(logger.severity(&ExceptionInfo::panic("boom")), Severity::Error);
    }

    #[test]
    fn test_panics_are_critical_by_default() {
        let (logger, _) = setup(|_| {});
        assert_eq!(logger.severity(&ExceptionInfo::panic("index out of bounds")), Severity::Critical);
    }

    #[test]
    fn test_previous_chain_is_capped() {
        let (logger, _) = setup(|c| c.exception_logger.max_previous_depth = 3);
        let record = logger.build_record(&chain(10), &Map::new(), None);
        assert_eq!(chain_len(&record["previous"]), 3);

        let short = logger.build_record(&chain(2), &Map::new(), None);
        assert_eq!(chain_len(&short["previous"]), 1);
    }

    #[test]
    fn test_ignored_classes_and_patterns() {
        let (logger, memory) = setup(|c| {
            c.exception_logger.ignore = vec!["http::NotFound".into()];
            c.exception_logger.ignore_patterns = vec!["validation::*".into()];
        });

        logger.log(&ExceptionInfo::new("routes::Missing", "m").with_lineage(["http::NotFound"]), &Map::new(), None);
        logger.log(&ExceptionInfo::new("validation::EmailInvalid", "m"), &Map::new(), None);
        assert!(memory.is_empty());

        logger.log(&ExceptionInfo::new("db::Timeout", "m"), &Map::new(), None);
        assert_eq!(memory.len(), 1);
        assert_eq!(memory.lines()[0].level, Level::ERROR);
    }

    #[test]
    fn test_request_user_and_context() {
        let (logger, _) = setup(|c| c.exception_logger.log_request_body = true);
        let mut request = RequestInfo::new("POST", "/checkout")
            .with_route("/checkout")
            .with_header("X-Workspace-Id", "ws-4")
            .with_body(r#"{"card_number":"4111","credit_card":"4111"}"#);
        request.user_id = Some("u-1".into());
        request.request_id = Some("req-9".into());

        let mut context = Map::new();
        context.insert("order".into(), json!(12));
        context.insert("secret".into(), json!("s"));

        let record = logger.build_record(&ExceptionInfo::new("shop::PaymentError", "declined"), &context, Some(&request));
        assert_eq!(record["request_id"], "req-9");
        assert_eq!(record["request"]["route"], "/checkout");
        assert_eq!(record["request"]["body"]["credit_card"], "********");
        assert_eq!(record["user"]["id"], "u-1");
        assert_eq!(record["user"]["workspace_id"], "ws-4");
        assert_eq!(record["context"]["secret"], "********");
        assert_eq!(record["context"]["order"], 12);
        assert_eq!(record["labels"]["exception_class"], "PaymentError");
        assert_eq!(record["labels"]["severity"], "error");
    }
}
