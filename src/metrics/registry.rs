//! Pull-model exporter backed by an in-process metrics registry.
//!
//! Storage is opened lazily on the first call made while the exporter is
//! enabled. A failed open leaves the exporter inert until the next call retries.

use crate::config::{ObservatoryConfig, PrometheusConfig};
use crate::metrics::storage::{default_opener, MetricStorage, StorageOpener};
use crate::metrics::{
    sanitize_label_value, sanitize_metric_name, Exporter, ExporterKind, MetricType, DEFAULT_METRICS,
    EXCEPTIONS_TOTAL, HTTP_OUTBOUND_DURATION, HTTP_OUTBOUND_REQUESTS_TOTAL, HTTP_REQUESTS_TOTAL,
    HTTP_REQUEST_DURATION, JOBS_DURATION, JOBS_PROCESSED_TOTAL,
};
use crate::types::{ExceptionInfo, InboundRecord, JobRecord, OutboundRecord};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// A registered metric. The first registration of a name is final.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricIdentity {
    pub namespace: String,
    pub name: String,
    pub metric_type: MetricType,
    pub label_names: Vec<String>,
}

impl MetricIdentity {
    pub fn full_name(&self) -> String {
        format!("{}_{}", self.namespace, self.name)
    }

    fn same_labels(&self, label_names: &[String]) -> bool {
        let ours: BTreeSet<&String> = self.label_names.iter().collect();
        let theirs: BTreeSet<&String> = label_names.iter().collect();
        ours == theirs
    }
}

struct RegistryState {
    storage: Box<dyn MetricStorage>,
    identities: HashMap<String, MetricIdentity>,
}

pub struct RegistryExporter {
    enabled: bool,
    namespace: String,
    config: PrometheusConfig,
    opener: StorageOpener,
    state: Mutex<Option<RegistryState>>,
}

impl RegistryExporter {
    pub fn new(config: &ObservatoryConfig) -> Self {
        Self::with_opener(config, default_opener())
    }

    pub fn with_opener(config: &ObservatoryConfig, opener: StorageOpener) -> Self {
        Self {
            enabled: config.enabled && config.prometheus.enabled,
            namespace: sanitize_metric_name(&config.app_name),
            config: config.prometheus.clone(),
            opener,
            state: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Identity registered under a sanitized name, if any.
    pub fn identity(&self, name: &str) -> Option<MetricIdentity> {
        let guard = self.lock();
        guard
            .as_ref()
            .and_then(|state| state.identities.get(&sanitize_metric_name(name)).cloned())
    }

    fn lock(&self) -> MutexGuard<'_, Option<RegistryState>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run `f` against initialized state. Returns `None` while disabled or when
    /// storage cannot be opened.
    fn with_state<T>(&self, f: impl FnOnce(&mut RegistryState, &str) -> T) -> Option<T> {
        if !self.enabled {
            return None;
        }

        let mut guard = self.lock();
        if guard.is_none() {
            match (self.opener)(&self.config) {
                Ok(storage) => {
                    let mut state = RegistryState { storage, identities: HashMap::new() };
                    register_defaults(&mut state, &self.namespace);
                    info!(
                        "Metrics registry initialized with {} default metrics (namespace '{}')",
                        DEFAULT_METRICS.len(),
                        self.namespace
                    );
                    *guard = Some(state);
                }
                Err(e) => {
                    warn!("Metrics storage unavailable, skipping: {}", e);
                    return None;
                }
            }
        }

        guard.as_mut().map(|state| f(state, &self.namespace))
    }

    fn update(&self, metric_type: MetricType, name: &str, labels: &[(&str, &str)], sample: Sample) {
        let label_names: Vec<String> = labels.iter().map(|(k, _)| sanitize_metric_name(k)).collect();
        let label_pairs: Vec<(String, String)> = label_names
            .iter()
            .zip(labels.iter())
            .map(|(k, (_, v))| (k.clone(), sanitize_label_value(v)))
            .collect();

        self.with_state(|state, namespace| {
            let Some(identity) = state.resolve(namespace, metric_type, name, label_names, "") else {
                return;
            };
            // Series keys are order sensitive, so follow the registered order
            let ordered: Vec<(String, String)> = identity
                .label_names
                .iter()
                .filter_map(|n| label_pairs.iter().find(|(k, _)| k == n).cloned())
                .collect();
            let full_name = identity.full_name();

            match sample {
                Sample::Count(n) => state.storage.increment_counter(&full_name, &ordered, n),
                Sample::Value(v) if metric_type == MetricType::Gauge => {
                    state.storage.set_gauge(&full_name, &ordered, v)
                }
                Sample::Value(v) => state.storage.observe_histogram(&full_name, &ordered, v),
            }
        });
    }

    fn record_pair(&self, counter: &str, histogram: &str, labels: &[(&str, &str)], duration: f64) {
        self.update(MetricType::Counter, counter, labels, Sample::Count(1));
        self.update(MetricType::Histogram, histogram, labels, Sample::Value(duration));
    }
}

#[derive(Debug, Clone, Copy)]
enum Sample {
    Count(u64),
    Value(f64),
}

impl RegistryState {
    /// Get-or-create the identity for `name`. `None` when the name is already
    /// registered with a different shape.
    fn resolve(
        &mut self,
        namespace: &str,
        metric_type: MetricType,
        name: &str,
        label_names: Vec<String>,
        help: &str,
    ) -> Option<MetricIdentity> {
        let sanitized = sanitize_metric_name(name);

        if let Some(existing) = self.identities.get(&sanitized) {
            if existing.metric_type == metric_type && existing.same_labels(&label_names) {
                return Some(existing.clone());
            }
            warn!(
                "Metric '{}' already registered as {:?} with labels {:?}; dropping update with {:?} {:?}",
                sanitized, existing.metric_type, existing.label_names, metric_type, label_names
            );
            return None;
        }

        let identity = MetricIdentity {
            namespace: namespace.to_string(),
            name: sanitized.clone(),
            metric_type,
            label_names,
        };
        let full_name = identity.full_name();

        let help = if help.is_empty() {
            let kind = match metric_type {
                MetricType::Counter => "counter",
                MetricType::Gauge => "gauge",
                MetricType::Histogram => "histogram",
            };
            format!("Custom {}: {}", kind, name)
        } else {
            help.to_string()
        };
        self.storage.describe(&full_name, metric_type, &help);
        debug!("Registered metric {}", full_name);

        self.identities.insert(sanitized, identity.clone());
        Some(identity)
    }
}

fn register_defaults(state: &mut RegistryState, namespace: &str) {
    for doc in DEFAULT_METRICS {
        let label_names = doc.labels.iter().map(|l| l.to_string()).collect();
        state.resolve(namespace, doc.metric_type, doc.name, label_names, doc.help);
    }
}

#[async_trait]
impl Exporter for RegistryExporter {
    fn record_inbound(&self, record: &InboundRecord) {
        let status = record.status_code.to_string();
        let labels = [
            ("method", record.method.as_str()),
            ("route", record.route.as_str()),
            ("status_code", status.as_str()),
        ];
        self.record_pair(HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION, &labels, record.duration);
    }

    fn record_outbound(&self, record: &OutboundRecord) {
        let status = record.status_code.to_string();
        let labels = [
            ("method", record.method.as_str()),
            ("host", record.host.as_str()),
            ("status_code", status.as_str()),
        ];
        self.record_pair(HTTP_OUTBOUND_REQUESTS_TOTAL, HTTP_OUTBOUND_DURATION, &labels, record.duration);
    }

    fn record_job(&self, record: &JobRecord) {
        let labels = [
            ("job_name", record.job_name.as_str()),
            ("queue", record.queue.as_str()),
            ("status", record.status.as_str()),
        ];
        self.record_pair(JOBS_PROCESSED_TOTAL, JOBS_DURATION, &labels, record.duration);
    }

    fn record_exception(&self, exception: &ExceptionInfo, _context: &Map<String, Value>) {
        let labels = [
            ("exception_class", exception.class.as_str()),
            ("file", exception.file_basename()),
        ];
        self.update(MetricType::Counter, EXCEPTIONS_TOTAL, &labels, Sample::Count(1));
    }

    fn increment_counter(&self, name: &str, labels: &[(&str, &str)], value: u64) {
        self.update(MetricType::Counter, name, labels, Sample::Count(value));
    }

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.update(MetricType::Gauge, name, labels, Sample::Value(value));
    }

    fn observe_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.update(MetricType::Histogram, name, labels, Sample::Value(value));
    }

    fn output(&self) -> String {
        self.with_state(|state, _| state.storage.render()).unwrap_or_default()
    }

    async fn flush(&self) {}

    fn kind(&self) -> ExporterKind {
        ExporterKind::Registry
    }
}
