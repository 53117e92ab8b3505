//! Delivery of push batches to the remote ingest API.

use crate::config::PushConfig;
use crate::constants::INGEST_PATH;
use crate::error::{ObservatoryError, Result};
use crate::metrics::push::BufferEntry;
use async_trait::async_trait;
use tracing::{debug, warn};

#[async_trait]
pub trait IngestTransport: Send + Sync {
    async fn send(&self, batch: &[BufferEntry]) -> Result<()>;
}

/// `POST {endpoint}/api/v1/ingest` with bearer authentication.
pub struct HttpIngestTransport {
    client: reqwest::Client,
    url: String,
    api_key: String,
    project_id: String,
}

impl HttpIngestTransport {
    pub fn new(config: &PushConfig) -> Self {
        let client = match reqwest::Client::builder().timeout(config.timeout()).build() {
            Ok(client) => client,
            Err(e) => {
                warn!("Failed to build ingest HTTP client, using defaults: {}", e);
                reqwest::Client::new()
            }
        };

        Self {
            client,
            url: format!("{}{}", config.endpoint.trim_end_matches('/'), INGEST_PATH),
            api_key: config.credential().unwrap_or_default().to_string(),
            project_id: config.project_id.clone(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl IngestTransport for HttpIngestTransport {
    async fn send(&self, batch: &[BufferEntry]) -> Result<()> {
        let body = serde_json::json!({
            "project_id": self.project_id,
            "data": batch,
        });

        debug!("ingest: pushing {} entries to {}", batch.len(), self.url);

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("X-Project-ID", &self.project_id)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ObservatoryError::Delivery { status, body });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_without_double_slash() {
        let config = PushConfig { endpoint: "https://ingest.example.com/".into(), ..PushConfig::default() };
        let transport = HttpIngestTransport::new(&config);
        assert_eq!(transport.url(), "https://ingest.example.com/api/v1/ingest");
    }
}
