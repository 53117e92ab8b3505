//! Job collection: start/end pairing by job key with a bounded start map.

use crate::collectors::timing::StartSnapshot;
use crate::collectors::tracker::StartTracker;
use crate::config::{JobsConfig, ObservatoryConfig};
use crate::loggers::JobLogger;
use crate::masker::SensitiveDataMasker;
use crate::metrics::Exporter;
use crate::patterns::PatternSet;
use crate::types::{now_rfc3339, ExceptionInfo, JobEvent, JobFailure, JobRecord, JobStatus, Labels};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct JobCollector {
    enabled: bool,
    exceptions_enabled: bool,
    config: JobsConfig,
    exclude_jobs: PatternSet,
    ignore_exceptions: Vec<String>,
    labels: Labels,
    masker: Arc<SensitiveDataMasker>,
    tracker: StartTracker<String>,
    exporter: Arc<dyn Exporter>,
    logger: Arc<JobLogger>,
}

impl JobCollector {
    pub fn new(
        config: &ObservatoryConfig,
        masker: Arc<SensitiveDataMasker>,
        exporter: Arc<dyn Exporter>,
        logger: Arc<JobLogger>,
    ) -> Self {
        Self {
            enabled: config.enabled && config.jobs.enabled,
            exceptions_enabled: config.enabled && config.exceptions.enabled,
            config: config.jobs.clone(),
            exclude_jobs: PatternSet::new(&config.jobs.exclude_jobs),
            ignore_exceptions: config.exceptions.ignore.clone(),
            labels: config.labels.clone(),
            masker,
            tracker: StartTracker::new(
                Duration::from_secs(config.tracking.ttl_secs),
                Duration::from_secs(config.tracking.sweep_interval_secs),
            ),
            exporter,
            logger,
        }
    }

    pub fn should_monitor(&self, job: &JobEvent) -> bool {
        self.enabled && !self.exclude_jobs.matches(&job.job_name)
    }

    pub fn start(&self, job: &JobEvent) {
        if self.should_monitor(job) || self.logger.is_enabled() {
            self.tracker.insert(job.key(), StartSnapshot::now());
        }
    }

    /// Finish an execution. A missing start event counts as starting now.
    pub fn end(&self, job: &JobEvent, status: JobStatus, exception: Option<&ExceptionInfo>) -> Option<JobRecord> {
        let snapshot = match self.tracker.remove(&job.key()) {
            Some(snapshot) => snapshot,
            None => {
                debug!("No start recorded for job {}, timing from now", job.key());
                StartSnapshot::now()
            }
        };
        let elapsed = snapshot.elapsed();

        let record = if self.should_monitor(job) {
            let record = JobRecord {
                job_id: job.job_id.clone(),
                job_name: job.job_name.clone(),
                queue: job.queue.clone(),
                connection: job.connection.clone(),
                status,
                duration: elapsed.as_secs_f64(),
                attempts: job.attempts,
                timestamp: now_rfc3339(),
                payload: self.payload(job),
                exception: exception.map(JobFailure::from),
                labels: self.labels.clone(),
            };
            self.exporter.record_job(&record);

            if let Some(exception) = exception {
                if self.should_record_exception(exception) {
                    let mut context = Map::new();
                    context.insert("job_name".into(), json!(job.job_name));
                    context.insert("queue".into(), json!(job.queue));
                    self.exporter.record_exception(exception, &context);
                }
            }
            Some(record)
        } else {
            None
        };

        self.logger.log(job, status, elapsed, snapshot.memory_delta(), exception);
        record
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    fn should_record_exception(&self, exception: &ExceptionInfo) -> bool {
        self.exceptions_enabled && !self.ignore_exceptions.iter().any(|c| exception.is_instance_of(c))
    }

    fn payload(&self, job: &JobEvent) -> Option<Value> {
        if !self.config.record_payload {
            return None;
        }
        let masked = self.masker.mask_value(job.payload.as_ref()?);
        let size = serde_json::to_string(&masked).map(|s| s.len()).unwrap_or(0);
        if size > self.config.max_payload_size {
            return Some(json!({ "_truncated": true, "_size": size }));
        }
        Some(masked)
    }
}
