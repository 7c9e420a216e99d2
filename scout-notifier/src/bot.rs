use std::time;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Enumeration of errors for message delivery through the chat platform.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("a message could not be delivered but it could be retried later: {reason}")]
    Retryable {
        reason: String,
        retry_after: Option<time::Duration>,
    },
    #[error("a message could not be delivered and it cannot be retried further: {0}")]
    NonRetryable(String),
}

/// One inbound message from the chat platform's update stream.
#[derive(Debug, Clone, PartialEq)]
pub struct BotUpdate {
    pub update_id: i64,
    pub chat_id: i64,
    pub text: String,
}

/// The chat-bot collaborator. The menu/keyboard UI lives in its own service;
/// this core only sends messages and reads the admin's replies.
#[async_trait]
pub trait BotClient: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError>;
    /// Long-poll for updates after `offset`, returned in order.
    async fn next_updates(&self, offset: i64) -> Result<Vec<BotUpdate>, DeliveryError>;
}

/// Bot API client over HTTP (Telegram wire format).
pub struct TelegramClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

const POLL_TIMEOUT_SECS: u64 = 25;

impl TelegramClient {
    pub fn new(base_url: String, token: String) -> Self {
        let client = reqwest::Client::builder()
            // Must exceed the long-poll window.
            .timeout(time::Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .build()
            .expect("failed to construct reqwest client for the bot API");

        Self {
            client,
            base_url,
            token,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }
}

#[derive(Deserialize)]
struct UpdatesResponse {
    result: Vec<RawUpdate>,
}

#[derive(Deserialize)]
struct RawUpdate {
    update_id: i64,
    message: Option<RawMessage>,
}

#[derive(Deserialize)]
struct RawMessage {
    chat: RawChat,
    text: Option<String>,
}

#[derive(Deserialize)]
struct RawChat {
    id: i64,
}

impl UpdatesResponse {
    /// Updates without a text message (stickers, edits, joins) are dropped,
    /// but their offsets must still advance.
    fn updates(self) -> Vec<BotUpdate> {
        self.result
            .into_iter()
            .map(|raw| {
                let (chat_id, text) = match raw.message {
                    Some(message) => (message.chat.id, message.text.unwrap_or_default()),
                    None => (0, String::new()),
                };
                BotUpdate {
                    update_id: raw.update_id,
                    chat_id,
                    text,
                }
            })
            .collect()
    }
}

#[async_trait]
impl BotClient for TelegramClient {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await
            .map_err(|e| DeliveryError::Retryable {
                reason: e.to_string(),
                retry_after: None,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        if is_retryable_status(status) {
            let retry_after = parse_retry_after_header(response.headers());
            Err(DeliveryError::Retryable {
                reason: format!("retryable status code {}", status),
                retry_after,
            })
        } else {
            // e.g. the user blocked the bot: retrying cannot help.
            Err(DeliveryError::NonRetryable(format!(
                "non-retryable status code {}",
                status
            )))
        }
    }

    async fn next_updates(&self, offset: i64) -> Result<Vec<BotUpdate>, DeliveryError> {
        let response = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", POLL_TIMEOUT_SECS.to_string()),
            ])
            .send()
            .await
            .map_err(|e| DeliveryError::Retryable {
                reason: e.to_string(),
                retry_after: None,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Retryable {
                reason: format!("getUpdates returned {}", status),
                retry_after: parse_retry_after_header(response.headers()),
            });
        }

        let parsed =
            response
                .json::<UpdatesResponse>()
                .await
                .map_err(|e| DeliveryError::Retryable {
                    reason: e.to_string(),
                    retry_after: None,
                })?;
        Ok(parsed.updates())
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Attempt to parse a duration from a Retry-After header, returning None if not possible.
/// Retry-After header can specify a date in RFC2822 or a number of seconds; we try to parse both.
/// If a Retry-After header is not present in the provided `header_map`, `None` is returned.
fn parse_retry_after_header(header_map: &reqwest::header::HeaderMap) -> Option<time::Duration> {
    let retry_after_header = header_map.get(reqwest::header::RETRY_AFTER);

    let retry_after = match retry_after_header {
        Some(header_value) => match header_value.to_str() {
            Ok(s) => s,
            Err(_) => {
                return None;
            }
        },
        None => {
            return None;
        }
    };

    if let Ok(u) = retry_after.parse::<u64>() {
        let duration = time::Duration::from_secs(u);
        return Some(duration);
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_status() {
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn test_parse_retry_after_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "120".parse().unwrap());

        let duration = parse_retry_after_header(&headers).unwrap();
        assert_eq!(duration, time::Duration::from_secs(120));

        headers.remove(reqwest::header::RETRY_AFTER);

        let duration = parse_retry_after_header(&headers);
        assert_eq!(duration, None);

        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );

        let duration = parse_retry_after_header(&headers);
        assert_eq!(duration, None);
    }

    #[test]
    fn parses_update_payloads() {
        let payload = r#"{
            "ok": true,
            "result": [
                {"update_id": 10, "message": {"chat": {"id": 777}, "text": "4821"}},
                {"update_id": 11, "message": {"chat": {"id": 778}}},
                {"update_id": 12}
            ]
        }"#;

        let parsed: UpdatesResponse = serde_json::from_str(payload).unwrap();
        let updates = parsed.updates();

        assert_eq!(updates.len(), 3);
        assert_eq!(
            updates[0],
            BotUpdate {
                update_id: 10,
                chat_id: 777,
                text: "4821".to_owned(),
            }
        );
        // Non-text updates keep their offsets so polling can advance.
        assert_eq!(updates[1].update_id, 11);
        assert!(updates[1].text.is_empty());
        assert_eq!(updates[2].chat_id, 0);
    }
}
