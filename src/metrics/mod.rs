//! Exporter abstraction and its two strategies.
//!
//! The registry exporter keeps series in an in-process Prometheus registry that
//! is scraped through the metrics endpoint. The push exporter buffers records and
//! delivers them in batches to a remote ingest API.

pub mod push;
pub mod redis_storage;
pub mod registry;
pub mod storage;
pub mod transport;

pub use crate::config::ExporterKind;
pub use push::{BufferEntry, BufferedPushExporter, EntryKind};
pub use redis_storage::RedisStorage;
pub use registry::{MetricIdentity, RegistryExporter};
pub use storage::{MetricStorage, PrometheusStorage, StorageOpener};
pub use transport::{HttpIngestTransport, IngestTransport};

use crate::config::ObservatoryConfig;
use crate::constants::MAX_LABEL_VALUE_LEN;
use crate::masker::SensitiveDataMasker;
use crate::types::{ExceptionInfo, InboundRecord, JobRecord, OutboundRecord};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Destination for every metric the collectors produce.
#[async_trait]
pub trait Exporter: Send + Sync {
    fn record_inbound(&self, record: &InboundRecord);

    fn record_outbound(&self, record: &OutboundRecord);

    fn record_job(&self, record: &JobRecord);

    fn record_exception(&self, exception: &ExceptionInfo, context: &Map<String, Value>);

    fn increment_counter(&self, name: &str, labels: &[(&str, &str)], value: u64);

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    fn observe_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Wire rendering of the current state. Empty when there is nothing to expose.
    fn output(&self) -> String;

    /// Deliver anything buffered. Pull exporters have nothing to do.
    async fn flush(&self);

    fn kind(&self) -> ExporterKind;
}

/// Build the exporter selected by `config.exporter`.
pub fn create_exporter(config: &ObservatoryConfig, masker: Arc<SensitiveDataMasker>) -> Arc<dyn Exporter> {
    match config.exporter {
        ExporterKind::Registry => Arc::new(RegistryExporter::new(config)),
        ExporterKind::Push => Arc::new(BufferedPushExporter::new(config, masker)),
    }
}

/// Documentation for a single metric
#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
    pub labels: &'static [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
    Gauge,
}

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION: &str = "http_request_duration_seconds";
pub const HTTP_OUTBOUND_REQUESTS_TOTAL: &str = "http_outbound_requests_total";
pub const HTTP_OUTBOUND_DURATION: &str = "http_outbound_duration_seconds";
pub const JOBS_PROCESSED_TOTAL: &str = "jobs_processed_total";
pub const JOBS_DURATION: &str = "jobs_duration_seconds";
pub const EXCEPTIONS_TOTAL: &str = "exceptions_total";

/// Registered up front when a registry opens its storage.
pub const DEFAULT_METRICS: &[MetricDoc] = &[
    MetricDoc {
        name: HTTP_REQUESTS_TOTAL,
        metric_type: MetricType::Counter,
        help: "Total number of inbound HTTP requests",
        labels: &["method", "route", "status_code"],
    },
    MetricDoc {
        name: HTTP_REQUEST_DURATION,
        metric_type: MetricType::Histogram,
        help: "Inbound HTTP request duration in seconds",
        labels: &["method", "route", "status_code"],
    },
    MetricDoc {
        name: HTTP_OUTBOUND_REQUESTS_TOTAL,
        metric_type: MetricType::Counter,
        help: "Total number of outbound HTTP requests",
        labels: &["method", "host", "status_code"],
    },
    MetricDoc {
        name: HTTP_OUTBOUND_DURATION,
        metric_type: MetricType::Histogram,
        help: "Outbound HTTP request duration in seconds",
        labels: &["method", "host", "status_code"],
    },
    MetricDoc {
        name: JOBS_PROCESSED_TOTAL,
        metric_type: MetricType::Counter,
        help: "Total number of processed jobs",
        labels: &["job_name", "queue", "status"],
    },
    MetricDoc {
        name: JOBS_DURATION,
        metric_type: MetricType::Histogram,
        help: "Job execution duration in seconds",
        labels: &["job_name", "queue", "status"],
    },
    MetricDoc {
        name: EXCEPTIONS_TOTAL,
        metric_type: MetricType::Counter,
        help: "Total number of exceptions",
        labels: &["exception_class", "file"],
    },
];

/// Make `name` a valid metric or label name: `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn sanitize_metric_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    match sanitized.chars().next() {
        None => sanitized.push('_'),
        Some(c) if c.is_ascii_digit() => sanitized.insert(0, '_'),
        _ => {}
    }
    sanitized
}

/// Cap a label value at the maximum length, in characters.
pub fn sanitize_label_value(value: &str) -> String {
    value.chars().take(MAX_LABEL_VALUE_LEN).collect()
}
