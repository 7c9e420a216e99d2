use async_trait::async_trait;
use thiserror::Error;

use scout_common::listing::RawListing;

#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("enrichment request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Opaque analysis of a raw listing, e.g. structured fields extracted from
/// free-form community posts. The result is attached to the listing as-is;
/// the pipeline never interprets it and never blocks on it.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, raw: &RawListing) -> Result<Option<serde_json::Value>, EnrichError>;
}

/// Used when no enrichment endpoint is configured.
pub struct NoopEnricher {}

#[async_trait]
impl Enricher for NoopEnricher {
    async fn enrich(&self, _raw: &RawListing) -> Result<Option<serde_json::Value>, EnrichError> {
        Ok(None)
    }
}

/// Calls the external analysis service over HTTP.
pub struct HttpEnricher {
    client: reqwest::Client,
    url: String,
}

impl HttpEnricher {
    pub fn new(url: String, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to construct reqwest client for enrichment");

        Self { client, url }
    }
}

#[async_trait]
impl Enricher for HttpEnricher {
    async fn enrich(&self, raw: &RawListing) -> Result<Option<serde_json::Value>, EnrichError> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "source": raw.source.to_string(),
                "external_id": raw.external_id,
                "text": raw.raw_text,
            }))
            .send()
            .await?
            .error_for_status()?;

        let analysis = response.json::<serde_json::Value>().await?;
        Ok(Some(analysis))
    }
}
