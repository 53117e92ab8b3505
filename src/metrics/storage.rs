//! Storage backends for the registry exporter.

use crate::config::{PrometheusConfig, StorageKind};
use crate::error::{ObservatoryError, Result};
use crate::metrics::redis_storage::RedisStorage;
use crate::metrics::MetricType;
use metrics::{Key, KeyName, Label, Level, Metadata, Recorder, SharedString};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::sync::Arc;

/// Where registered series live and how they are rendered.
pub trait MetricStorage: Send + Sync {
    fn describe(&self, name: &str, metric_type: MetricType, help: &str);

    fn increment_counter(&self, name: &str, labels: &[(String, String)], value: u64);

    fn set_gauge(&self, name: &str, labels: &[(String, String)], value: f64);

    fn observe_histogram(&self, name: &str, labels: &[(String, String)], value: f64);

    fn render(&self) -> String;
}

/// Opens storage on first use. Hosts can swap in their own backend here.
pub type StorageOpener = Arc<dyn Fn(&PrometheusConfig) -> Result<Box<dyn MetricStorage>> + Send + Sync>;

/// The opener for the configured built-in backend.
pub fn default_opener() -> StorageOpener {
    Arc::new(|config: &PrometheusConfig| match config.storage {
        StorageKind::Memory => {
            PrometheusStorage::new(&config.buckets).map(|s| Box::new(s) as Box<dyn MetricStorage>)
        }
        StorageKind::Redis => {
            RedisStorage::connect(&config.redis, &config.buckets).map(|s| Box::new(s) as Box<dyn MetricStorage>)
        }
    })
}

/// In-process Prometheus registry.
///
/// The recorder is built but never installed as the global recorder, so any
/// number of exporters can coexist in one process.
pub struct PrometheusStorage {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl PrometheusStorage {
    pub fn new(buckets: &[f64]) -> Result<Self> {
        let recorder = PrometheusBuilder::new()
            .set_buckets(buckets)
            .map_err(|e| ObservatoryError::Storage(e.to_string()))?
            .build_recorder();
        let handle = recorder.handle();
        Ok(Self { recorder, handle })
    }

    fn key(name: &str, labels: &[(String, String)]) -> Key {
        let labels: Vec<Label> = labels
            .iter()
            .map(|(k, v)| Label::new(k.clone(), v.clone()))
            .collect();
        Key::from_parts(name.to_string(), labels)
    }

    fn metadata() -> Metadata<'static> {
        Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
    }
}

impl MetricStorage for PrometheusStorage {
    fn describe(&self, name: &str, metric_type: MetricType, help: &str) {
        let key = KeyName::from(name.to_string());
        let help = SharedString::from(help.to_string());
        match metric_type {
            MetricType::Counter => self.recorder.describe_counter(key, None, help),
            MetricType::Gauge => self.recorder.describe_gauge(key, None, help),
            MetricType::Histogram => self.recorder.describe_histogram(key, None, help),
        }
    }

    fn increment_counter(&self, name: &str, labels: &[(String, String)], value: u64) {
        self.recorder
            .register_counter(&Self::key(name, labels), &Self::metadata())
            .increment(value);
    }

    fn set_gauge(&self, name: &str, labels: &[(String, String)], value: f64) {
        self.recorder
            .register_gauge(&Self::key(name, labels), &Self::metadata())
            .set(value);
    }

    fn observe_histogram(&self, name: &str, labels: &[(String, String)], value: f64) {
        self.recorder
            .register_histogram(&Self::key(name, labels), &Self::metadata())
            .record(value);
    }

    fn render(&self) -> String {
        self.handle.render()
    }
}
