use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use scout_common::listing::RawListing;

use crate::relay::RelayError;

pub mod community;
pub mod krisha;

/// Enumeration of errors for a single collector run. All of them are
/// contained to that run: the orchestrator logs the failure and the
/// collector's schedule continues.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("source temporarily unavailable: {0}")]
    SourceUnavailable(String),
    #[error("request to source failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("interactive login failed: {0}")]
    Auth(#[from] RelayError),
    #[error("channel session error: {0}")]
    Session(#[from] community::SessionError),
}

/// A source-specific scraping unit, run on its own schedule. One run never
/// overlaps with itself; different collectors may run concurrently.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;
    fn interval(&self) -> Duration;
    async fn collect(&self) -> Result<Vec<RawListing>, CollectError>;
}
