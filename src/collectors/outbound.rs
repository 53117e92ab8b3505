//! Outbound HTTP collection: times a send, records it and hands the result back.

use crate::collectors::timing::StartSnapshot;
use crate::config::{ObservatoryConfig, OutboundConfig};
use crate::loggers::OutboundRequestLogger;
use crate::masker::SensitiveDataMasker;
use crate::metrics::Exporter;
use crate::patterns::PatternSet;
use crate::types::{now_rfc3339, ExceptionInfo, Labels, OutboundRecord, OutboundRequest, OutboundResponse};
use axum::http;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Anything an outbound send can resolve to.
pub trait AsOutboundResponse {
    fn to_outbound_response(&self) -> OutboundResponse;
}

impl AsOutboundResponse for OutboundResponse {
    fn to_outbound_response(&self) -> OutboundResponse {
        self.clone()
    }
}

impl AsOutboundResponse for reqwest::Response {
    fn to_outbound_response(&self) -> OutboundResponse {
        OutboundResponse::new(self.status().as_u16())
    }
}

/// A `reqwest::Response` whose body may have been read ahead for capture.
struct CapturedResponse {
    response: reqwest::Response,
    body: Option<String>,
}

impl AsOutboundResponse for CapturedResponse {
    fn to_outbound_response(&self) -> OutboundResponse {
        OutboundResponse { status: self.response.status().as_u16(), body: self.body.clone() }
    }
}

impl CapturedResponse {
    /// Reads the body when its length is known and at most `limit`, then
    /// rebuilds the response around the bytes. Other bodies stay unread.
    async fn read(response: reqwest::Response, limit: Option<usize>) -> reqwest::Result<Self> {
        let fits = matches!((limit, response.content_length()), (Some(limit), Some(len)) if len <= limit as u64);
        if !fits {
            return Ok(Self { response, body: None });
        }

        let status = response.status();
        let version = response.version();
        let headers = response.headers().clone();
        let bytes = response.bytes().await?;
        let body = (!bytes.is_empty()).then(|| String::from_utf8_lossy(&bytes).into_owned());

        let mut rebuilt = http::Response::new(bytes);
        *rebuilt.status_mut() = status;
        *rebuilt.version_mut() = version;
        *rebuilt.headers_mut() = headers;
        Ok(Self { response: reqwest::Response::from(rebuilt), body })
    }
}

pub struct OutboundCollector {
    enabled: bool,
    config: OutboundConfig,
    exclude_hosts: PatternSet,
    labels: Labels,
    masker: Arc<SensitiveDataMasker>,
    exporter: Arc<dyn Exporter>,
    logger: Arc<OutboundRequestLogger>,
}

impl OutboundCollector {
    pub fn new(
        config: &ObservatoryConfig,
        masker: Arc<SensitiveDataMasker>,
        exporter: Arc<dyn Exporter>,
        logger: Arc<OutboundRequestLogger>,
    ) -> Self {
        Self {
            enabled: config.enabled && config.outbound.enabled,
            config: config.outbound.clone(),
            exclude_hosts: PatternSet::case_insensitive(&config.outbound.exclude_hosts),
            labels: config.labels.clone(),
            masker,
            exporter,
            logger,
        }
    }

    pub fn should_monitor(&self, host: &str) -> bool {
        self.enabled && !self.exclude_hosts.matches(host)
    }

    /// Largest response body to read for `host`, or `None` when no body is
    /// recorded or logged for it.
    pub fn body_limit(&self, host: &str) -> Option<usize> {
        let recorded = (self.config.record_body && self.should_monitor(host)).then_some(self.config.max_body_size);
        match (recorded, self.logger.body_limit(host)) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Time `send` to completion and record the outcome. The send result is
    /// returned untouched, errors included.
    pub async fn intercept<T, E, Fut>(&self, request: &OutboundRequest, send: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        T: AsOutboundResponse,
        E: std::error::Error + 'static,
    {
        let snapshot = StartSnapshot::now();
        let result = send.await;
        let elapsed = snapshot.elapsed();

        match &result {
            Ok(response) => {
                let response = response.to_outbound_response();
                self.complete(request, Some(&response), elapsed, None);
            }
            Err(e) => {
                let error = ExceptionInfo::from_error(e);
                self.complete(request, None, elapsed, Some(&error));
            }
        }

        result
    }

    /// Record a finished call. Returns the record handed to the exporter, if any.
    pub fn complete(
        &self,
        request: &OutboundRequest,
        response: Option<&OutboundResponse>,
        elapsed: Duration,
        error: Option<&ExceptionInfo>,
    ) -> Option<OutboundRecord> {
        let host = request.host();

        let record = if self.should_monitor(&host) {
            let body = |text: Option<&String>| {
                if !self.config.record_body {
                    return None;
                }
                text.map(|t| self.masker.truncate(&self.masker.mask_json(t), self.config.max_body_size))
            };

            let record = OutboundRecord {
                method: request.method.to_uppercase(),
                host,
                path: request.path(),
                full_url: request.url.clone(),
                status_code: response.map(|r| r.status).unwrap_or(0),
                duration: elapsed.as_secs_f64(),
                error: error.map(|e| e.message.clone()),
                timestamp: now_rfc3339(),
                request_body: body(request.body.as_ref()),
                response_body: body(response.and_then(|r| r.body.as_ref())),
                labels: self.labels.clone(),
            };
            self.exporter.record_outbound(&record);
            Some(record)
        } else {
            None
        };

        self.logger.log(request, response, elapsed, error);
        record
    }
}

/// A `reqwest::Client` whose calls are observed.
#[derive(Clone)]
pub struct ObservedClient {
    client: reqwest::Client,
    collector: Arc<OutboundCollector>,
    request_id: Option<String>,
}

impl ObservedClient {
    pub fn new(client: reqwest::Client, collector: Arc<OutboundCollector>) -> Self {
        Self { client, collector, request_id: None }
    }

    /// Tag calls with the id of the inbound request they serve.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn execute(&self, request: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        let info = self.describe(&request);
        let limit = self.collector.body_limit(&info.host());
        let send = async {
            let response = self.client.execute(request).await?;
            CapturedResponse::read(response, limit).await
        };
        self.collector.intercept(&info, send).await.map(|captured| captured.response)
    }

    fn describe(&self, request: &reqwest::Request) -> OutboundRequest {
        let mut info = OutboundRequest::new(request.method().as_str(), request.url().as_str());
        info.headers = request
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
            .collect();
        info.body = request
            .body()
            .and_then(|b| b.as_bytes())
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
        info.request_id = self.request_id.clone();
        info
    }

    pub async fn get(&self, url: &str) -> reqwest::Result<reqwest::Response> {
        let request = self.client.get(url).build()?;
        self.execute(request).await
    }

    pub async fn post_json<B: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> reqwest::Result<reqwest::Response> {
        let request = self.client.post(url).json(body).build()?;
        self.execute(request).await
    }
}
