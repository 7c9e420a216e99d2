use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use scout_common::listing::{RawListing, Source};

use super::{CollectError, Collector};
use crate::relay::CredentialRelay;

#[derive(Error, Debug)]
pub enum SessionError {
    /// The scraping session hit an interactive-login challenge and needs a
    /// one-time code before it can serve any more reads.
    #[error("session requires interactive login: {0}")]
    AuthRequired(String),
    #[error("session request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// One post fetched from a chat community channel.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelPost {
    pub message_id: i64,
    pub text: String,
}

/// The chat-platform session held by the session daemon. The protocol
/// mechanics live outside this service; all we rely on is reading recent
/// posts and submitting a login code when asked for one.
#[async_trait]
pub trait ChannelSession: Send + Sync {
    async fn recent_posts(&self, channel_id: i64) -> Result<Vec<ChannelPost>, SessionError>;
    async fn submit_code(&self, code: &str) -> Result<(), SessionError>;
}

/// HTTP client for the session daemon.
pub struct HttpChannelSession {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChannelSession {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to construct reqwest client for channel session");

        Self { client, base_url }
    }
}

#[async_trait]
impl ChannelSession for HttpChannelSession {
    async fn recent_posts(&self, channel_id: i64) -> Result<Vec<ChannelPost>, SessionError> {
        let url = format!("{}/channels/{}/messages", self.base_url, channel_id);
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let hint = response.text().await.unwrap_or_default();
            return Err(SessionError::AuthRequired(hint));
        }

        let posts = response
            .error_for_status()?
            .json::<Vec<ChannelPost>>()
            .await?;
        Ok(posts)
    }

    async fn submit_code(&self, code: &str) -> Result<(), SessionError> {
        let url = format!("{}/login", self.base_url);
        self.client
            .post(&url)
            .json(&serde_json::json!({ "code": code }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Collector for roommate/rental posts in chat community channels. When the
/// session needs interactive login, the run suspends on the credential relay
/// until the administrator supplies a code or the wait window elapses.
pub struct CommunityCollector {
    session: Arc<dyn ChannelSession>,
    relay: Arc<CredentialRelay>,
    session_id: String,
    channels: Vec<i64>,
    interval: Duration,
    price_pattern: Regex,
}

impl CommunityCollector {
    pub fn new(
        session: Arc<dyn ChannelSession>,
        relay: Arc<CredentialRelay>,
        session_id: String,
        channels: Vec<i64>,
        interval: Duration,
    ) -> Self {
        Self {
            session,
            relay,
            session_id,
            channels,
            interval,
            price_pattern: Regex::new(r"(\d[\d\s]{3,8})\s*(?:тг|тенге|₸)")
                .expect("valid price pattern"),
        }
    }

    async fn channel_posts(&self, channel_id: i64) -> Result<Vec<ChannelPost>, CollectError> {
        match self.session.recent_posts(channel_id).await {
            Ok(posts) => Ok(posts),
            Err(SessionError::AuthRequired(hint)) => {
                info!(
                    channel_id = channel_id,
                    "session needs interactive login, relaying code request"
                );
                let code = self.relay.request_code(&self.session_id, &hint).await?;
                self.session.submit_code(&code).await?;
                Ok(self.session.recent_posts(channel_id).await?)
            }
            Err(error) => Err(error.into()),
        }
    }
}

/// Fallback for posts the enrichment service has not analyzed: the first
/// amount followed by a tenge marker.
fn extract_price(pattern: &Regex, text: &str) -> Option<i64> {
    let capture = pattern.captures(text)?;
    let digits: String = capture
        .get(1)?
        .as_str()
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[async_trait]
impl Collector for CommunityCollector {
    fn name(&self) -> &str {
        "community"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn collect(&self) -> Result<Vec<RawListing>, CollectError> {
        let mut listings = Vec::new();

        for &channel_id in &self.channels {
            let posts = match self.channel_posts(channel_id).await {
                Ok(posts) => posts,
                // A single unreachable channel must not sink the others,
                // but a failed login applies to the whole session.
                Err(CollectError::Session(SessionError::Request(error))) => {
                    warn!(channel_id = channel_id, "skipping channel: {}", error);
                    continue;
                }
                Err(error) => return Err(error),
            };

            for post in posts {
                let price = extract_price(&self.price_pattern, &post.text);
                listings.push(RawListing {
                    source: Source::Community(channel_id),
                    external_id: post.message_id.to_string(),
                    url: None,
                    price,
                    rooms: None,
                    city: None,
                    location: None,
                    area_sqm: None,
                    raw_text: post.text,
                    enrichment: None,
                });
            }
        }

        Ok(listings)
    }
}
