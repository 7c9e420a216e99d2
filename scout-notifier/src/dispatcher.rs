use std::sync::Arc;

use metrics::counter;
use sqlx::postgres::PgPool;
use tracing::{error, warn};

use scout_common::listing::Listing;
use scout_common::retry::RetryPolicy;
use scout_common::store::{connect_pool, StoreError, StoreResult};

use crate::bot::{BotClient, DeliveryError};

/// Outcome of a notification attempt, as seen by the pipeline.
#[derive(Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    Delivered,
    Skipped,
    Failed,
}

/// Durable (user, listing) pairs: the de-duplication key that makes
/// notifications effectively once per user and listing.
#[derive(Clone)]
pub struct NotificationStore {
    pool: PgPool,
}

impl NotificationStore {
    pub fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        Ok(Self {
            pool: connect_pool(url, max_connections)?,
        })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn already_sent(&self, user_id: i64, listing_id: i64) -> StoreResult<bool> {
        sqlx::query_scalar(
            r#"SELECT EXISTS (SELECT 1 FROM notification_records WHERE user_id = $1 AND listing_id = $2)"#,
        )
        .bind(user_id)
        .bind(listing_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }

    /// Record a delivered notification. The primary key makes this a no-op
    /// when a concurrent attempt recorded the pair first.
    pub async fn record(&self, user_id: i64, listing_id: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"INSERT INTO notification_records (user_id, listing_id) VALUES ($1, $2) ON CONFLICT DO NOTHING"#,
        )
        .bind(user_id)
        .bind(listing_id)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        Ok(result.rows_affected() == 1)
    }
}

enum Attempt {
    Delivered,
    Skipped,
    Retry(Option<std::time::Duration>),
    Fatal(String),
}

/// Delivers one message per (user, listing) match.
///
/// The ordering is the whole point: check the record, send, then write the
/// record. A failed send never writes, so it stays retryable; a crash
/// between send and write re-sends at most once. Exactly-once as users see
/// it comes from this at-most-once write plus at-least-once retries.
pub struct Dispatcher {
    store: NotificationStore,
    bot: Arc<dyn BotClient>,
    retry_policy: RetryPolicy,
    max_attempts: u32,
}

impl Dispatcher {
    pub fn new(
        store: NotificationStore,
        bot: Arc<dyn BotClient>,
        retry_policy: RetryPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            bot,
            retry_policy,
            max_attempts,
        }
    }

    async fn attempt(&self, user_id: i64, listing: &Listing) -> Result<Attempt, StoreError> {
        if self.store.already_sent(user_id, listing.id).await? {
            return Ok(Attempt::Skipped);
        }

        match self.bot.send_message(user_id, &render_message(listing)).await {
            Ok(()) => {
                self.store.record(user_id, listing.id).await?;
                Ok(Attempt::Delivered)
            }
            Err(DeliveryError::Retryable { reason, retry_after }) => {
                warn!(user_id = user_id, "delivery failed, will retry: {}", reason);
                Ok(Attempt::Retry(retry_after))
            }
            Err(DeliveryError::NonRetryable(reason)) => Ok(Attempt::Fatal(reason)),
        }
    }

    /// A single delivery attempt with the idempotence guard. `Failed`
    /// results wrote no record and are safe to retry.
    pub async fn notify(&self, user_id: i64, listing: &Listing) -> Result<NotifyOutcome, StoreError> {
        let outcome = match self.attempt(user_id, listing).await? {
            Attempt::Delivered => NotifyOutcome::Delivered,
            Attempt::Skipped => NotifyOutcome::Skipped,
            Attempt::Retry(_) => NotifyOutcome::Failed,
            Attempt::Fatal(reason) => {
                error!(user_id = user_id, "dropping notification: {}", reason);
                NotifyOutcome::Failed
            }
        };
        Ok(outcome)
    }

    /// Retry transient delivery failures with bounded backoff.
    pub async fn notify_with_retry(
        &self,
        user_id: i64,
        listing: &Listing,
    ) -> Result<NotifyOutcome, StoreError> {
        let mut attempt = 0;
        loop {
            match self.attempt(user_id, listing).await? {
                Attempt::Delivered => {
                    counter!("scout_notifications_total", &[("outcome", "delivered")]).increment(1);
                    return Ok(NotifyOutcome::Delivered);
                }
                Attempt::Skipped => {
                    counter!("scout_notifications_total", &[("outcome", "skipped")]).increment(1);
                    return Ok(NotifyOutcome::Skipped);
                }
                Attempt::Fatal(reason) => {
                    counter!("scout_notifications_total", &[("outcome", "failed")]).increment(1);
                    error!(user_id = user_id, "dropping notification: {}", reason);
                    return Ok(NotifyOutcome::Failed);
                }
                Attempt::Retry(retry_after) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        counter!("scout_notifications_total", &[("outcome", "failed")]).increment(1);
                        return Ok(NotifyOutcome::Failed);
                    }
                    let backoff = self.retry_policy.retry_interval(attempt - 1, retry_after);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

/// Render the user-facing message for one listing.
pub fn render_message(listing: &Listing) -> String {
    let mut message = String::from("New listing for your filter!\n\n");

    if let Some(rooms) = listing.rooms {
        match listing.area_sqm {
            Some(area) => message.push_str(&format!("🏠 {}-room, {} m²\n", rooms, area)),
            None => message.push_str(&format!("🏠 {}-room\n", rooms)),
        }
    }
    if let Some(city) = &listing.city {
        message.push_str(&format!("🏙️ {}\n", capitalize(city)));
    }
    if let Some(location) = &listing.location {
        message.push_str(&format!("📍 {}\n", location));
    }
    if let Some(price) = listing.price {
        message.push_str(&format!("💰 {} tg\n", price));
    }

    match &listing.url {
        Some(url) => message.push_str(&format!("\n{}\n", url)),
        None if !listing.raw_text.is_empty() => {
            let mut text = listing.raw_text.clone();
            if text.chars().count() > 200 {
                text = text.chars().take(197).collect::<String>() + "...";
            }
            message.push_str(&format!("\n{}\n", text));
        }
        None => {}
    }

    message
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use scout_common::listing::Source;
    use sqlx::PgPool;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted bot: pops one delivery result per send, records the rest.
    struct ScriptedBot {
        script: Mutex<Vec<Result<(), DeliveryError>>>,
        sent: Mutex<Vec<(i64, String)>>,
    }

    impl ScriptedBot {
        fn delivering() -> Arc<Self> {
            Self::scripted(vec![])
        }

        fn scripted(script: Vec<Result<(), DeliveryError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl BotClient for ScriptedBot {
        async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError> {
            let mut script = self.script.lock().unwrap();
            let result = if script.is_empty() {
                Ok(())
            } else {
                script.remove(0)
            };
            if result.is_ok() {
                self.sent.lock().unwrap().push((chat_id, text.to_owned()));
            }
            result
        }

        async fn next_updates(&self, _offset: i64) -> Result<Vec<crate::bot::BotUpdate>, DeliveryError> {
            Ok(vec![])
        }
    }

    fn listing() -> Listing {
        Listing {
            id: 1,
            source: Source::Krisha,
            external_id: "123".to_owned(),
            url: Some("https://krisha.kz/a/show/123".to_owned()),
            price: Some(150_000),
            rooms: Some(2),
            city: Some("almaty".to_owned()),
            location: Some("Abay Ave 10".to_owned()),
            area_sqm: Some(45.0),
            raw_text: "2-room apartment".to_owned(),
            enrichment: None,
            first_seen_at: chrono::Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap(),
        }
    }

    fn retryable() -> DeliveryError {
        DeliveryError::Retryable {
            reason: "status 429".to_owned(),
            retry_after: None,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(1, Duration::from_millis(1), None)
    }

    async fn record_count(db: &PgPool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM notification_records")
            .fetch_one(db)
            .await
            .unwrap()
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn delivered_then_skipped(db: PgPool) {
        let bot = ScriptedBot::delivering();
        let dispatcher = Dispatcher::new(
            NotificationStore::new_from_pool(db.clone()),
            bot.clone(),
            fast_policy(),
            3,
        );

        assert_eq!(
            dispatcher.notify(42, &listing()).await.unwrap(),
            NotifyOutcome::Delivered
        );
        // The second call does not touch the bot at all.
        assert_eq!(
            dispatcher.notify(42, &listing()).await.unwrap(),
            NotifyOutcome::Skipped
        );

        assert_eq!(bot.sent_count(), 1);
        assert_eq!(record_count(&db).await, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn failed_delivery_writes_no_record(db: PgPool) {
        let bot = ScriptedBot::scripted(vec![Err(retryable())]);
        let dispatcher = Dispatcher::new(
            NotificationStore::new_from_pool(db.clone()),
            bot.clone(),
            fast_policy(),
            3,
        );

        assert_eq!(
            dispatcher.notify(42, &listing()).await.unwrap(),
            NotifyOutcome::Failed
        );
        assert_eq!(record_count(&db).await, 0);

        // The failure left the pair retryable.
        assert_eq!(
            dispatcher.notify(42, &listing()).await.unwrap(),
            NotifyOutcome::Delivered
        );
        assert_eq!(record_count(&db).await, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn retry_loop_recovers_from_transient_failures(db: PgPool) {
        let bot = ScriptedBot::scripted(vec![Err(retryable()), Err(retryable())]);
        let dispatcher = Dispatcher::new(
            NotificationStore::new_from_pool(db.clone()),
            bot.clone(),
            fast_policy(),
            5,
        );

        assert_eq!(
            dispatcher.notify_with_retry(42, &listing()).await.unwrap(),
            NotifyOutcome::Delivered
        );
        assert_eq!(bot.sent_count(), 1);
        assert_eq!(record_count(&db).await, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn retry_loop_gives_up_after_max_attempts(db: PgPool) {
        let bot = ScriptedBot::scripted(vec![
            Err(retryable()),
            Err(retryable()),
            Err(retryable()),
        ]);
        let dispatcher = Dispatcher::new(
            NotificationStore::new_from_pool(db.clone()),
            bot.clone(),
            fast_policy(),
            3,
        );

        assert_eq!(
            dispatcher.notify_with_retry(42, &listing()).await.unwrap(),
            NotifyOutcome::Failed
        );
        assert_eq!(record_count(&db).await, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn non_retryable_failure_stops_immediately(db: PgPool) {
        let bot = ScriptedBot::scripted(vec![Err(DeliveryError::NonRetryable(
            "status 403".to_owned(),
        ))]);
        let dispatcher = Dispatcher::new(
            NotificationStore::new_from_pool(db.clone()),
            bot.clone(),
            fast_policy(),
            5,
        );

        assert_eq!(
            dispatcher.notify_with_retry(42, &listing()).await.unwrap(),
            NotifyOutcome::Failed
        );
        assert_eq!(bot.sent_count(), 0);
        assert_eq!(record_count(&db).await, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn concurrent_notifies_write_at_most_one_record(db: PgPool) {
        let bot = ScriptedBot::delivering();
        let dispatcher = Arc::new(Dispatcher::new(
            NotificationStore::new_from_pool(db.clone()),
            bot,
            fast_policy(),
            3,
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.notify(42, &listing()).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(record_count(&db).await, 1);
    }

    #[test]
    fn renders_website_listings_with_link() {
        let message = render_message(&listing());
        assert!(message.contains("2-room, 45 m²"));
        assert!(message.contains("Almaty"));
        assert!(message.contains("150000 tg"));
        assert!(message.contains("https://krisha.kz/a/show/123"));
    }

    #[test]
    fn renders_community_posts_with_trimmed_text() {
        let mut community = listing();
        community.url = None;
        community.raw_text = "x".repeat(300);

        let message = render_message(&community);
        assert!(message.contains("..."));
        assert!(!message.contains(&"x".repeat(250)));
    }
}
