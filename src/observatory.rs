//! Composition root: builds every component from one configuration.

use crate::collectors::{InboundCollector, JobCollector, ObservedClient, OutboundCollector};
use crate::config::{ExporterKind, ObservatoryConfig};
use crate::loggers::{ChannelRegistry, ExceptionLogger, InboundRequestLogger, JobLogger, OutboundRequestLogger};
use crate::masker::SensitiveDataMasker;
use crate::metrics::{create_exporter, Exporter};
use crate::types::{ExceptionInfo, RequestInfo};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

pub struct Observatory {
    config: Arc<ObservatoryConfig>,
    masker: Arc<SensitiveDataMasker>,
    exporter: Arc<dyn Exporter>,
    channels: Arc<ChannelRegistry>,
    inbound: Arc<InboundCollector>,
    outbound: Arc<OutboundCollector>,
    jobs: Arc<JobCollector>,
    exception_logger: Arc<ExceptionLogger>,
}

impl Observatory {
    pub fn new(config: ObservatoryConfig) -> Self {
        Self::with_channels(config, Arc::new(ChannelRegistry::new()))
    }

    pub fn with_channels(config: ObservatoryConfig, channels: Arc<ChannelRegistry>) -> Self {
        let masker = Arc::new(SensitiveDataMasker::from_config(&config.masking));
        let exporter = create_exporter(&config, masker.clone());
        Self::assemble(config, masker, exporter, channels)
    }

    /// Use a prebuilt exporter, e.g. one with a custom storage opener or transport.
    pub fn with_exporter(config: ObservatoryConfig, exporter: Arc<dyn Exporter>, channels: Arc<ChannelRegistry>) -> Self {
        let masker = Arc::new(SensitiveDataMasker::from_config(&config.masking));
        Self::assemble(config, masker, exporter, channels)
    }

    fn assemble(
        config: ObservatoryConfig,
        masker: Arc<SensitiveDataMasker>,
        exporter: Arc<dyn Exporter>,
        channels: Arc<ChannelRegistry>,
    ) -> Self {
        let inbound_logger = Arc::new(InboundRequestLogger::new(&config, masker.clone(), channels.clone()));
        let outbound_logger = Arc::new(OutboundRequestLogger::new(&config, masker.clone(), channels.clone()));
        let job_logger = Arc::new(JobLogger::new(&config, masker.clone(), channels.clone()));
        let exception_logger = Arc::new(ExceptionLogger::new(&config, masker.clone(), channels.clone()));

        let inbound = Arc::new(InboundCollector::new(&config, masker.clone(), exporter.clone(), inbound_logger));
        let outbound = Arc::new(OutboundCollector::new(&config, masker.clone(), exporter.clone(), outbound_logger));
        let jobs = Arc::new(JobCollector::new(&config, masker.clone(), exporter.clone(), job_logger));

        info!(
            "Observatory initialized (app '{}', exporter {:?}, enabled {})",
            config.app_name,
            exporter.kind(),
            config.enabled
        );

        Self {
            config: Arc::new(config),
            masker,
            exporter,
            channels,
            inbound,
            outbound,
            jobs,
            exception_logger,
        }
    }

    pub fn config(&self) -> &ObservatoryConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn exporter(&self) -> Arc<dyn Exporter> {
        self.exporter.clone()
    }

    pub fn masker(&self) -> Arc<SensitiveDataMasker> {
        self.masker.clone()
    }

    pub fn channels(&self) -> Arc<ChannelRegistry> {
        self.channels.clone()
    }

    pub fn inbound(&self) -> Arc<InboundCollector> {
        self.inbound.clone()
    }

    pub fn outbound(&self) -> Arc<OutboundCollector> {
        self.outbound.clone()
    }

    pub fn jobs(&self) -> Arc<JobCollector> {
        self.jobs.clone()
    }

    pub fn exception_logger(&self) -> Arc<ExceptionLogger> {
        self.exception_logger.clone()
    }

    pub fn increment(&self, name: &str, labels: &[(&str, &str)], value: u64) {
        if self.is_enabled() {
            self.exporter.increment_counter(name, labels, value);
        }
    }

    pub fn gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        if self.is_enabled() {
            self.exporter.set_gauge(name, value, labels);
        }
    }

    pub fn histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        if self.is_enabled() {
            self.exporter.observe_histogram(name, value, labels);
        }
    }

    /// Record the exception metric and write the exception log record.
    pub fn report_exception(&self, exception: &ExceptionInfo, context: &Map<String, Value>, request: Option<&RequestInfo>) {
        let exceptions = &self.config.exceptions;
        let ignored = exceptions.ignore.iter().any(|c| exception.is_instance_of(c));
        if self.is_enabled() && exceptions.enabled && !ignored {
            self.exporter.record_exception(exception, context);
        }
        self.exception_logger.log(exception, context, request);
    }

    /// Report an error result and hand it back unchanged.
    pub fn observe_result<T, E>(&self, result: Result<T, E>, context: &Map<String, Value>) -> Result<T, E>
    where
        E: std::error::Error + 'static,
    {
        if let Err(e) = &result {
            self.report_exception(&ExceptionInfo::from_error(e), context, None);
        }
        result
    }

    /// An HTTP client whose calls feed the outbound collector.
    pub fn http_client(&self, client: reqwest::Client) -> ObservedClient {
        ObservedClient::new(client, self.outbound.clone())
    }

    pub fn output(&self) -> String {
        self.exporter.output()
    }

    pub async fn flush(&self) {
        self.exporter.flush().await;
    }

    /// Flush the push exporter on its batch interval so quiet periods still
    /// deliver. `None` for the registry exporter.
    pub fn spawn_periodic_flush(&self) -> Option<JoinHandle<()>> {
        if self.exporter.kind() != ExporterKind::Push || !self.is_enabled() {
            return None;
        }
        let exporter = self.exporter.clone();
        let period = self.config.push.batch_interval().max(Duration::from_secs(1));

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                exporter.flush().await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loggers::MemoryChannel;
    use serde_json::json;
    use std::fmt;

    #[derive(Debug)]
    struct Declined;

    impl fmt::Display for Declined {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "card declined")
        }
    }

    impl std::error::Error for Declined {}

    fn observatory(adjust: impl FnOnce(&mut ObservatoryConfig)) -> (Observatory, Arc<MemoryChannel>) {
        let mut config = ObservatoryConfig::default();
        config.app_name = "shop".into();
        config.prometheus.enabled = true;
        config.exception_logger.enabled = true;
        adjust(&mut config);

        let channels = Arc::new(ChannelRegistry::new());
        let logs = Arc::new(MemoryChannel::new());
        channels.register(config.log_channel.clone(), logs.clone());
        (Observatory::with_channels(config, channels), logs)
    }

    #[test]
    fn test_facade_metrics() {
        let (obs, _) = observatory(|_| {});
        obs.increment("orders.placed", &[("plan", "pro")], 2);
        obs.gauge("queue_depth", 7.0, &[]);
        obs.histogram("basket_value", 42.5, &[]);

        let output = obs.output();
        assert!(output.contains("shop_orders_placed{plan=\"pro\"} 2"));
        assert!(output.contains("shop_queue_depth 7"));
        assert!(output.contains("# TYPE shop_basket_value histogram"));
    }

    #[test]
    fn test_disabled_facade_records_nothing() {
        let (obs, _) = observatory(|c| c.enabled = false);
        obs.increment("orders", &[], 1);
        assert_eq!(obs.output(), "");
    }

    #[test]
    fn test_observe_result_reports_and_returns_error() {
        let (obs, logs) = observatory(|_| {});
        let mut context = Map::new();
        context.insert("order_id".into(), json!(5));

        let result: Result<(), Declined> = obs.observe_result(Err(Declined), &context);
        assert!(result.is_err());
        assert!(obs.output().contains("shop_exceptions_total"));

        let lines = logs.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].record["message"], "card declined");
        assert_eq!(lines[0].record["context"]["order_id"], 5);
    }

    #[test]
    fn test_ignored_exception_is_not_counted() {
        let (obs, _) = observatory(|c| c.exceptions.ignore = vec!["NotFound".into()]);
        obs.report_exception(&ExceptionInfo::new("NotFound", "no route"), &Map::new(), None);
        assert!(!obs.output().contains("exception_class=\"NotFound\""));
    }

    #[tokio::test]
    async fn test_periodic_flush_only_for_push() {
        let (obs, _) = observatory(|_| {});
        assert!(obs.spawn_periodic_flush().is_none());

        let (push, _) = observatory(|c| c.exporter = ExporterKind::Push);
        let handle = push.spawn_periodic_flush().unwrap();
        handle.abort();
    }
}
