use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use health::HealthHandle;
use metrics::counter;
use rdkafka::consumer::StreamConsumer;
use rdkafka::message::Message;
use tracing::{error, info, warn};

use scout_common::messages::{CredentialRequested, ListingIngested};
use scout_common::store::StoreError;

use crate::admin::AdminRelay;
use crate::bot::BotClient;
use crate::dispatcher::Dispatcher;
use crate::filters::CachedFilters;
use crate::matching::matching_users;

/// The stage between `listing.ingested` and the administrator's users:
/// match one listing against the active filters and dispatch to every
/// matching user.
pub struct ListingProcessor {
    filters: CachedFilters,
    dispatcher: Dispatcher,
}

impl ListingProcessor {
    pub fn new(filters: CachedFilters, dispatcher: Dispatcher) -> Self {
        Self {
            filters,
            dispatcher,
        }
    }

    pub async fn process(&self, message: ListingIngested) -> Result<(), StoreError> {
        let filters = self.filters.get().await?;
        let users = matching_users(&message.listing, &filters);

        if users.is_empty() {
            return Ok(());
        }
        info!(
            listing_id = message.listing.id,
            matches = users.len(),
            "dispatching listing to matching users"
        );

        for user_id in users {
            // One user's failure must not starve the rest of the batch.
            if let Err(e) = self
                .dispatcher
                .notify_with_retry(user_id, &message.listing)
                .await
            {
                error!(
                    user_id = user_id,
                    listing_id = message.listing.id,
                    "notification attempt hit the store: {}", e
                );
            }
        }
        Ok(())
    }
}

/// Consume `listing.ingested` and run each listing through the processor.
/// Broker redeliveries are harmless: the notification records make the
/// dispatch stage idempotent.
pub async fn run_listing_consumer(
    consumer: StreamConsumer,
    processor: Arc<ListingProcessor>,
    liveness: HealthHandle,
) {
    let mut stream = consumer.stream();
    let mut interval = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                liveness.report_healthy();
            }
            result = stream.next() => {
                let Some(result) = result else {
                    continue;
                };
                let message = match result {
                    Ok(message) => message,
                    Err(e) => {
                        error!("listing consumer error: {}", e);
                        continue;
                    }
                };
                let Some(payload) = message.payload() else {
                    continue;
                };
                let ingested = match serde_json::from_slice::<ListingIngested>(payload) {
                    Ok(ingested) => ingested,
                    Err(e) => {
                        counter!("scout_consumer_deserialize_errors_total").increment(1);
                        warn!("failed to deserialize ingested listing: {}", e);
                        continue;
                    }
                };
                if let Err(e) = processor.process(ingested).await {
                    error!("failed to process ingested listing: {}", e);
                }
            }
        }
    }
}

/// Consume `credential.requested` and forward each prompt to the admin.
pub async fn run_credential_consumer(
    consumer: StreamConsumer,
    admin: Arc<AdminRelay>,
    liveness: HealthHandle,
) {
    let mut stream = consumer.stream();
    let mut interval = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                liveness.report_healthy();
            }
            result = stream.next() => {
                let Some(result) = result else {
                    continue;
                };
                let message = match result {
                    Ok(message) => message,
                    Err(e) => {
                        error!("credential consumer error: {}", e);
                        continue;
                    }
                };
                let Some(payload) = message.payload() else {
                    continue;
                };
                match serde_json::from_slice::<CredentialRequested>(payload) {
                    Ok(request) => admin.handle_request(request).await,
                    Err(e) => {
                        counter!("scout_consumer_deserialize_errors_total").increment(1);
                        warn!("failed to deserialize credential request: {}", e);
                    }
                }
            }
        }
    }
}

/// Long-poll the bot for updates and route messages from the administrator
/// chat into the credential relay. Everything else belongs to the bot UI
/// collaborator and is ignored here.
pub async fn run_update_poller(
    bot: Arc<dyn BotClient>,
    admin: Arc<AdminRelay>,
    admin_chat_id: i64,
    liveness: HealthHandle,
) {
    let mut offset = 0;

    loop {
        liveness.report_healthy();

        let updates = match bot.next_updates(offset).await {
            Ok(updates) => updates,
            Err(e) => {
                warn!("update poll failed: {}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            if update.chat_id != admin_chat_id || update.text.is_empty() {
                continue;
            }
            admin.handle_admin_message(&update.text).await;
        }
    }
}
