//! Push-model exporter: records are buffered and shipped in batches.
//!
//! Delivery is best effort. A failed batch is logged and dropped, never retried.

use crate::config::{ObservatoryConfig, PushConfig};
use crate::masker::SensitiveDataMasker;
use crate::metrics::transport::{HttpIngestTransport, IngestTransport};
use crate::metrics::{Exporter, ExporterKind};
use crate::types::{now_rfc3339, ExceptionInfo, InboundRecord, JobRecord, Labels, OutboundRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Inbound,
    Outbound,
    Job,
    Exception,
    Metric,
}

/// One buffered record as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferEntry {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(rename = "data")]
    pub payload: Value,
    pub app_name: String,
    pub labels: Labels,
    pub enqueued_at: String,
}

struct PushState {
    buffer: Vec<BufferEntry>,
    last_flush: Instant,
}

pub struct BufferedPushExporter {
    config: PushConfig,
    app_name: String,
    labels: Labels,
    masker: Arc<SensitiveDataMasker>,
    transport: Arc<dyn IngestTransport>,
    state: Mutex<PushState>,
}

impl BufferedPushExporter {
    pub fn new(config: &ObservatoryConfig, masker: Arc<SensitiveDataMasker>) -> Self {
        let transport = Arc::new(HttpIngestTransport::new(&config.push));
        Self::with_transport(config, masker, transport)
    }

    pub fn with_transport(
        config: &ObservatoryConfig,
        masker: Arc<SensitiveDataMasker>,
        transport: Arc<dyn IngestTransport>,
    ) -> Self {
        if config.push.credential().is_none() {
            warn!("Push exporter has no API key configured; metrics will not be sent");
        }

        Self {
            config: config.push.clone(),
            app_name: config.app_name.clone(),
            labels: config.labels.clone(),
            masker,
            transport,
            state: Mutex::new(PushState { buffer: Vec::new(), last_flush: Instant::now() }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.lock().buffer.len()
    }

    fn lock(&self) -> MutexGuard<'_, PushState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn enqueue(&self, kind: EntryKind, payload: Value) {
        let entry = BufferEntry {
            kind,
            payload: self.masker.mask_value(&payload),
            app_name: self.app_name.clone(),
            labels: self.labels.clone(),
            enqueued_at: now_rfc3339(),
        };

        let batch = {
            let mut state = self.lock();
            state.buffer.push(entry);

            let full = state.buffer.len() >= self.config.batch_size;
            let due = state.last_flush.elapsed() >= self.config.batch_interval();
            if !(full || due) {
                return;
            }
            state.last_flush = Instant::now();
            std::mem::take(&mut state.buffer)
        };

        self.dispatch(batch);
    }

    /// Hand an auto-flushed batch to the runtime without blocking the caller.
    fn dispatch(&self, batch: Vec<BufferEntry>) {
        if self.config.credential().is_none() {
            debug!("Discarding {} buffered entries: no API key", batch.len());
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let transport = self.transport.clone();
                handle.spawn(async move {
                    deliver(transport.as_ref(), batch).await;
                });
            }
            Err(_) => {
                warn!("No async runtime available; dropping {} buffered entries", batch.len());
            }
        }
    }

    fn metric(&self, metric_type: &str, name: &str, value: Value, labels: &[(&str, &str)]) {
        let labels: Map<String, Value> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        self.enqueue(
            EntryKind::Metric,
            json!({
                "type": metric_type,
                "name": name,
                "value": value,
                "labels": labels,
                "timestamp": now_rfc3339(),
            }),
        );
    }

    fn record<T: Serialize>(&self, kind: EntryKind, record: &T) {
        match serde_json::to_value(record) {
            Ok(payload) => self.enqueue(kind, payload),
            Err(e) => warn!("Failed to serialize {:?} record: {}", kind, e),
        }
    }
}

async fn deliver(transport: &dyn IngestTransport, batch: Vec<BufferEntry>) {
    let count = batch.len();
    match transport.send(&batch).await {
        Ok(()) => debug!("Delivered {} entries to ingest API", count),
        Err(e) => warn!("Failed to deliver {} entries to ingest API: {}", count, e),
    }
}

#[async_trait]
impl Exporter for BufferedPushExporter {
    fn record_inbound(&self, record: &InboundRecord) {
        self.record(EntryKind::Inbound, record);
    }

    fn record_outbound(&self, record: &OutboundRecord) {
        self.record(EntryKind::Outbound, record);
    }

    fn record_job(&self, record: &JobRecord) {
        self.record(EntryKind::Job, record);
    }

    fn record_exception(&self, exception: &ExceptionInfo, context: &Map<String, Value>) {
        let trace: Vec<String> = exception
            .trace
            .iter()
            .map(|frame| {
                format!(
                    "{}:{} {}",
                    frame.file.as_deref().unwrap_or("[internal]"),
                    frame.line.unwrap_or(0),
                    frame.function.as_deref().unwrap_or("")
                )
            })
            .collect();

        self.enqueue(
            EntryKind::Exception,
            json!({
                "exception_class": exception.class,
                "message": exception.message,
                "file": exception.file,
                "line": exception.line,
                "trace": trace.join("\n"),
                "context": context,
                "timestamp": now_rfc3339(),
            }),
        );
    }

    fn increment_counter(&self, name: &str, labels: &[(&str, &str)], value: u64) {
        self.metric("counter", name, json!(value), labels);
    }

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.metric("gauge", name, json!(value), labels);
    }

    fn observe_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.metric("histogram", name, json!(value), labels);
    }

    fn output(&self) -> String {
        let status = if self.config.credential().is_some() { "active" } else { "unconfigured" };
        let summary = json!({
            "status": status,
            "endpoint": self.config.endpoint,
            "project_id": self.config.project_id,
            "buffer_size": self.buffer_size(),
        });
        serde_json::to_string_pretty(&summary).unwrap_or_default()
    }

    async fn flush(&self) {
        let batch = {
            let mut state = self.lock();
            if state.buffer.is_empty() {
                return;
            }
            state.last_flush = Instant::now();
            std::mem::take(&mut state.buffer)
        };

        if self.config.credential().is_none() {
            debug!("Discarding {} buffered entries: no API key", batch.len());
            return;
        }

        deliver(self.transport.as_ref(), batch).await;
    }

    fn kind(&self) -> ExporterKind {
        ExporterKind::Push
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ObservatoryError, Result};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingTransport {
        batches: Mutex<Vec<Vec<BufferEntry>>>,
        fail: bool,
    }

    #[async_trait]
    impl IngestTransport for RecordingTransport {
        async fn send(&self, batch: &[BufferEntry]) -> Result<()> {
            self.batches.lock().unwrap().push(batch.to_vec());
            if self.fail {
                return Err(ObservatoryError::Delivery { status: 503, body: "unavailable".into() });
            }
            Ok(())
        }
    }

    fn config(batch_size: usize, api_key: Option<&str>) -> ObservatoryConfig {
        let mut config = ObservatoryConfig::default();
        config.app_name = "billing".into();
        config.push.batch_size = batch_size;
        config.push.api_key = api_key.map(str::to_string);
        config.push.project_id = "proj-7".into();
        config
    }

    fn exporter(config: &ObservatoryConfig, transport: Arc<RecordingTransport>) -> BufferedPushExporter {
        BufferedPushExporter::with_transport(config, Arc::new(SensitiveDataMasker::default()), transport)
    }

    #[tokio::test]
    async fn test_size_threshold_triggers_delivery() {
        let transport = Arc::new(RecordingTransport::default());
        let exporter = exporter(&config(2, Some("key")), transport.clone());

        exporter.increment_counter("orders", &[("plan", "pro")], 1);
        assert_eq!(exporter.buffer_size(), 1);
        exporter.increment_counter("orders", &[("plan", "pro")], 1);
        assert_eq!(exporter.buffer_size(), 0);
        exporter.increment_counter("orders", &[("plan", "pro")], 1);
        assert_eq!(exporter.buffer_size(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let batches = transport.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0][0].kind, EntryKind::Metric);
        assert_eq!(batches[0][0].payload["type"], "counter");
    }

    #[tokio::test]
    async fn test_interval_elapsing_triggers_delivery() {
        let transport = Arc::new(RecordingTransport::default());
        let mut config = config(100, Some("key"));
        config.push.batch_interval_secs = 1;
        let exporter = exporter(&config, transport.clone());

        exporter.increment_counter("orders", &[], 1);
        assert_eq!(exporter.buffer_size(), 1);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        exporter.increment_counter("orders", &[], 1);
        assert_eq!(exporter.buffer_size(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let batches = transport.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[tokio::test]
    async fn test_flush_without_key_discards() {
        let transport = Arc::new(RecordingTransport::default());
        let exporter = exporter(&config(100, None), transport.clone());

        exporter.set_gauge("queue_depth", 3.0, &[]);
        exporter.flush().await;

        assert_eq!(exporter.buffer_size(), 0);
        assert!(transport.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_delivery_clears_buffer() {
        let transport = Arc::new(RecordingTransport { fail: true, ..Default::default() });
        let exporter = exporter(&config(100, Some("key")), transport.clone());

        exporter.observe_histogram("latency", 0.2, &[]);
        exporter.flush().await;
        assert_eq!(exporter.buffer_size(), 0);

        // Nothing is retried on the next flush
        exporter.flush().await;
        assert_eq!(transport.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_flush_is_noop() {
        let transport = Arc::new(RecordingTransport::default());
        let exporter = exporter(&config(100, Some("key")), transport.clone());
        exporter.flush().await;
        assert!(transport.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payloads_are_masked() {
        let transport = Arc::new(RecordingTransport::default());
        let exporter = exporter(&config(100, Some("key")), transport.clone());

        let mut context = Map::new();
        context.insert("password".into(), json!("hunter2"));
        exporter.record_exception(&ExceptionInfo::new("PaymentError", "declined"), &context);
        exporter.flush().await;

        let batches = transport.batches.lock().unwrap();
        let entry = &batches[0][0];
        assert_eq!(entry.kind, EntryKind::Exception);
        assert_eq!(entry.payload["context"]["password"], "********");
        assert_eq!(entry.app_name, "billing");
        assert_eq!(entry.labels.get("environment").map(String::as_str), Some("production"));
    }

    #[test]
    fn test_no_runtime_drops_auto_flush() {
        let transport = Arc::new(RecordingTransport::default());
        let exporter = exporter(&config(1, Some("key")), transport.clone());
        exporter.increment_counter("orders", &[], 1);
        assert_eq!(exporter.buffer_size(), 0);
        assert!(transport.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn test_output_summary() {
        let transport = Arc::new(RecordingTransport::default());
        let exporter = exporter(&config(100, Some("key")), transport);
        exporter.increment_counter("orders", &[], 1);

        let summary: Value = serde_json::from_str(&exporter.output()).unwrap();
        assert_eq!(summary["status"], "active");
        assert_eq!(summary["project_id"], "proj-7");
        assert_eq!(summary["buffer_size"], 1);
    }

    #[test]
    fn test_entry_wire_names() {
        let entry = BufferEntry {
            kind: EntryKind::Job,
            payload: json!({"job_name": "SendInvoice"}),
            app_name: "billing".into(),
            labels: Labels::new(),
            enqueued_at: now_rfc3339(),
        };
        let wire = serde_json::to_value(&entry).unwrap();
        assert_eq!(wire["type"], "job");
        assert_eq!(wire["data"]["job_name"], "SendInvoice");
    }
}
