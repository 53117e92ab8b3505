//! Inbound request collection: start/end lifecycle around one handled request.

use crate::collectors::timing::StartSnapshot;
use crate::config::{InboundConfig, ObservatoryConfig};
use crate::loggers::InboundRequestLogger;
use crate::masker::SensitiveDataMasker;
use crate::metrics::Exporter;
use crate::patterns::PatternSet;
use crate::types::{now_rfc3339, InboundRecord, Labels, RequestInfo, ResponseInfo};
use std::sync::Arc;

/// Start state of one inbound request, carried by value to `end`.
#[derive(Debug, Clone, Copy)]
pub struct InboundObservation {
    snapshot: StartSnapshot,
    monitored: bool,
}

impl InboundObservation {
    pub fn is_monitored(&self) -> bool {
        self.monitored
    }
}

pub struct InboundCollector {
    enabled: bool,
    config: InboundConfig,
    exclude_paths: PatternSet,
    labels: Labels,
    masker: Arc<SensitiveDataMasker>,
    exporter: Arc<dyn Exporter>,
    logger: Arc<InboundRequestLogger>,
}

impl InboundCollector {
    pub fn new(
        config: &ObservatoryConfig,
        masker: Arc<SensitiveDataMasker>,
        exporter: Arc<dyn Exporter>,
        logger: Arc<InboundRequestLogger>,
    ) -> Self {
        Self {
            enabled: config.enabled && config.inbound.enabled,
            config: config.inbound.clone(),
            exclude_paths: PatternSet::new(&config.inbound.exclude_paths),
            labels: config.labels.clone(),
            masker,
            exporter,
            logger,
        }
    }

    pub fn should_monitor(&self, request: &RequestInfo) -> bool {
        self.enabled
            && self.config.methods.iter().any(|m| m.eq_ignore_ascii_case(&request.method))
            && !self.exclude_paths.matches_path(&request.path)
    }

    fn records_bodies(&self) -> bool {
        self.enabled && self.config.record_body
    }

    /// Whether the request body is read for metrics or logs.
    pub fn wants_request_body(&self) -> bool {
        self.records_bodies() || self.logger.captures_request_body()
    }

    /// Whether the response body is read for metrics or logs.
    pub fn wants_response_body(&self) -> bool {
        self.records_bodies() || self.logger.captures_response_body()
    }

    /// Largest body worth buffering. Bigger bodies pass through uncaptured.
    pub fn body_limit(&self) -> usize {
        let recorded = if self.records_bodies() { self.config.max_body_size } else { 0 };
        recorded.max(self.logger.body_limit())
    }

    pub fn start(&self, request: &RequestInfo) -> InboundObservation {
        InboundObservation { snapshot: StartSnapshot::now(), monitored: self.should_monitor(request) }
    }

    /// Finish the observation. Returns the record handed to the exporter, if any.
    pub fn end(
        &self,
        observation: InboundObservation,
        request: &RequestInfo,
        response: &ResponseInfo,
    ) -> Option<InboundRecord> {
        let elapsed = observation.snapshot.elapsed();

        let record = if observation.monitored {
            let record = self.build_record(&observation, request, response);
            self.exporter.record_inbound(&record);
            Some(record)
        } else {
            None
        };

        self.logger.log(request, response, elapsed);
        record
    }

    fn build_record(
        &self,
        observation: &InboundObservation,
        request: &RequestInfo,
        response: &ResponseInfo,
    ) -> InboundRecord {
        let body = |text: Option<&String>| {
            if !self.config.record_body {
                return None;
            }
            text.map(|t| self.masker.truncate(&self.masker.mask_json(t), self.config.max_body_size))
        };

        InboundRecord {
            method: request.method.to_uppercase(),
            uri: request.url.clone(),
            route: request.route_or_unknown().to_string(),
            status_code: response.status,
            duration: observation.snapshot.elapsed().as_secs_f64(),
            memory: observation.snapshot.memory_delta(),
            ip: request.ip.clone(),
            user_agent: request.user_agent().map(str::to_string),
            timestamp: now_rfc3339(),
            request_body: body(request.body.as_ref()),
            response_body: body(response.body.as_ref()),
            labels: self.labels.clone(),
        }
    }
}
