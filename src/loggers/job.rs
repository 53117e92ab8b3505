use crate::collectors::timing::{peak_memory_bytes, resident_memory_bytes};
use crate::config::{JobLogConfig, ObservatoryConfig};
use crate::loggers::{bytes_to_mb, format_trace, round2, sanitize_log_label, ChannelRegistry};
use crate::masker::SensitiveDataMasker;
use crate::patterns::PatternSet;
use crate::types::{now_rfc3339, ExceptionInfo, JobEvent, JobStatus};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

pub const JOB_MESSAGE: &str = "JOB_PROCESSED";

/// Writes one record per finished job execution.
pub struct JobLogger {
    enabled: bool,
    config: JobLogConfig,
    channel: String,
    exclude_jobs: PatternSet,
    masker: Arc<SensitiveDataMasker>,
    channels: Arc<ChannelRegistry>,
}

impl JobLogger {
    pub fn new(config: &ObservatoryConfig, masker: Arc<SensitiveDataMasker>, channels: Arc<ChannelRegistry>) -> Self {
        let logger = &config.job_logger;
        Self {
            enabled: config.enabled && logger.enabled,
            config: logger.clone(),
            channel: config.channel_or_default(&logger.channel).to_string(),
            exclude_jobs: PatternSet::new(&logger.exclude_jobs),
            masker,
            channels,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn should_log(&self, job: &JobEvent, status: JobStatus, duration: Duration) -> bool {
        if self.exclude_jobs.matches(&job.job_name) {
            return false;
        }
        if !self.config.only_statuses.is_empty() && !self.config.only_statuses.contains(&status) {
            return false;
        }
        let threshold = self.config.slow_threshold_ms;
        if threshold > 0 && duration < Duration::from_millis(threshold) {
            return false;
        }
        true
    }

    /// `memory_used` is the resident memory delta over the execution, in bytes.
    pub fn log(
        &self,
        job: &JobEvent,
        status: JobStatus,
        duration: Duration,
        memory_used: i64,
        exception: Option<&ExceptionInfo>,
    ) {
        if !self.enabled || !self.should_log(job, status, duration) {
            return;
        }

        let record = self.build_record(job, status, duration, memory_used, exception);
        let level = if status == JobStatus::Failed || exception.is_some() { Level::ERROR } else { Level::INFO };
        self.channels.write(&self.channel, level, JOB_MESSAGE, &record);
    }

    pub fn build_record(
        &self,
        job: &JobEvent,
        status: JobStatus,
        duration: Duration,
        memory_used: i64,
        exception: Option<&ExceptionInfo>,
    ) -> Value {
        let mut record = json!({
            "job_id": job.job_id,
            "job_name": job.job_name,
            "queue": job.queue,
            "connection": job.connection,
            "status": status,
            "duration_ms": round2(duration.as_secs_f64() * 1000.0),
            "attempts": job.attempts,
            "max_tries": job.max_tries,
            "timestamp": now_rfc3339(),
        });

        if self.config.log_memory {
            let peak = peak_memory_bytes().or_else(resident_memory_bytes).unwrap_or(0);
            record["memory"] = json!({
                "used_mb": round2(memory_used as f64 / 1024.0 / 1024.0),
                "peak_mb": bytes_to_mb(peak),
            });
        }

        if self.config.log_payload {
            if let Some(payload) = &job.payload {
                record["payload"] = self.payload_value(payload);
            }
        }

        if let Some(exception) = exception {
            let mut details = json!({
                "class": exception.class,
                "message": exception.message,
                "file": exception.file,
                "line": exception.line,
            });
            if self.config.log_stack_trace {
                details["trace"] = Value::Array(format_trace(&exception.trace, self.config.max_stack_frames, false));
            }
            record["exception"] = details;
        }

        let mut labels = self.config.labels.clone();
        labels.insert("job_name".into(), sanitize_log_label(&job.job_name));
        labels.insert("queue".into(), sanitize_log_label(&job.queue));
        labels.insert("status".into(), status.to_string());
        record["labels"] = json!(labels);

        record
    }

    /// Masked payload, or a size marker when its JSON exceeds the cap.
    fn payload_value(&self, payload: &Value) -> Value {
        let masked = self.masker.mask_value(payload);
        let size = serde_json::to_string(&masked).map(|s| s.len()).unwrap_or(0);
        if size > self.config.max_payload_size {
            return json!({ "_truncated": true, "_size": size });
        }
        masked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loggers::MemoryChannel;
    use crate::types::StackFrame;

    fn setup(adjust: impl FnOnce(&mut ObservatoryConfig)) -> (JobLogger, Arc<MemoryChannel>) {
        let mut config = ObservatoryConfig::default();
        config.job_logger.enabled = true;
        adjust(&mut config);
        let channels = Arc::new(ChannelRegistry::new());
        let memory = Arc::new(MemoryChannel::new());
        channels.register(config.log_channel.clone(), memory.clone());
        let logger = JobLogger::new(&config, Arc::new(SensitiveDataMasker::default()), channels);
        (logger, memory)
    }

    fn job() -> JobEvent {
        JobEvent::new("17", "billing::SendInvoice")
            .on("redis", "emails")
            .with_payload(json!({"invoice_id": 9, "api_token": "t0k"}))
    }

    #[test]
    fn test_processed_record() {
        let (logger, memory) = setup(|c| {
            c.job_logger.log_payload = true;
            c.job_logger.labels.insert("team".into(), "payments".into());
        });

        logger.log(&job(), JobStatus::Processed, Duration::from_millis(40), 2048, None);

        let lines = memory.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].level, Level::INFO);
        let record = &lines[0].record;
        assert_eq!(record["status"], "processed");
        assert_eq!(record["payload"]["api_token"], "********");
        assert_eq!(record["payload"]["invoice_id"], 9);
        assert_eq!(record["labels"]["job_name"], "billing__SendInvoice");
        assert_eq!(record["labels"]["team"], "payments");
        assert!(record["memory"]["used_mb"].is_number());
    }

    #[test]
    fn test_failed_record_with_capped_trace() {
        let (logger, memory) = setup(|c| {
            c.job_logger.log_stack_trace = true;
            c.job_logger.max_stack_frames = 2;
        });
        let trace = (0..5).map(|i| StackFrame::new("run", "src/jobs.rs", i)).collect();
        let exception = ExceptionInfo::new("MailerError", "smtp timeout").with_trace(trace);

        logger.log(&job(), JobStatus::Failed, Duration::ZERO, 0, Some(&exception));

        let lines = memory.lines();
        assert_eq!(lines[0].level, Level::ERROR);
        assert_eq!(lines[0].record["exception"]["message"], "smtp timeout");
        assert_eq!(lines[0].record["exception"]["trace"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_oversized_payload_is_replaced() {
        let (logger, _) = setup(|c| {
            c.job_logger.log_payload = true;
            c.job_logger.max_payload_size = 10;
        });
        let record = logger.build_record(&job(), JobStatus::Processed, Duration::ZERO, 0, None);
        assert_eq!(record["payload"]["_truncated"], true);
        assert!(record["payload"]["_size"].as_u64().unwrap() > 10);
    }

    #[test]
    fn test_filters() {
        let (logger, memory) = setup(|c| {
            c.job_logger.exclude_jobs = vec!["health::*".into()];
            c.job_logger.only_statuses = vec![JobStatus::Failed];
        });

        logger.log(&JobEvent::new("1", "health::Ping"), JobStatus::Failed, Duration::ZERO, 0, None);
        logger.log(&job(), JobStatus::Processed, Duration::ZERO, 0, None);
        assert!(memory.is_empty());

        logger.log(&job(), JobStatus::Failed, Duration::ZERO, 0, None);
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn test_disabled_by_default() {
        let config = ObservatoryConfig::default();
        let logger = JobLogger::new(&config, Arc::new(SensitiveDataMasker::default()), Arc::new(ChannelRegistry::new()));
        assert!(!logger.is_enabled());
    }
}
