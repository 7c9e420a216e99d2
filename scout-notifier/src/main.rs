//! Notification service: consumes ingested listings, matches them against
//! user filters and delivers matches through the chat bot. Also answers the
//! scraper's credential prompts via the administrator chat.
use std::sync::Arc;

use axum::routing::get;
use envconfig::Envconfig;
use health::HealthRegistry;

use scout_common::kafka::{self, KafkaPublisher, PrintPublisher, Publisher};
use scout_common::messages::{CREDENTIAL_REQUESTED_TOPIC, LISTING_INGESTED_TOPIC};
use scout_common::metrics::{serve, setup_metrics_router};
use scout_common::retry::RetryPolicy;
use scout_notifier::admin::AdminRelay;
use scout_notifier::bot::{BotClient, TelegramClient};
use scout_notifier::config::Config;
use scout_notifier::consumer::{
    run_credential_consumer, run_listing_consumer, run_update_poller, ListingProcessor,
};
use scout_notifier::dispatcher::{Dispatcher, NotificationStore};
use scout_notifier::filters::{CachedFilters, FilterStore};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    let liveness = HealthRegistry::new("liveness");

    let notifications = NotificationStore::new(&config.database_url, config.max_pg_connections)
        .expect("failed to initialize notification store");
    let filter_store = FilterStore::new(&config.database_url, config.max_pg_connections)
        .expect("failed to initialize filter store");

    let bot: Arc<dyn BotClient> = Arc::new(TelegramClient::new(
        config.bot_base_url.clone(),
        config.bot_token.clone(),
    ));

    let publisher: Arc<dyn Publisher> = if config.print_broker {
        Arc::new(PrintPublisher {})
    } else {
        let producer_liveness = liveness.register("rdkafka", time::Duration::seconds(30));
        let producer = kafka::create_producer(&config.kafka, producer_liveness)
            .expect("failed to create kafka producer");
        Arc::new(KafkaPublisher::new(producer))
    };

    let retry_policy = RetryPolicy::new(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
        Some(config.retry_policy.maximum_interval.0),
    );
    let dispatcher = Dispatcher::new(
        notifications,
        bot.clone(),
        retry_policy,
        config.max_delivery_attempts,
    );
    let processor = Arc::new(ListingProcessor::new(
        CachedFilters::new(Arc::new(filter_store), config.filter_cache_ttl.0),
        dispatcher,
    ));

    let admin = Arc::new(AdminRelay::new(
        bot.clone(),
        publisher.clone(),
        config.admin_chat_id,
    ));

    let listing_consumer = kafka::create_consumer(
        &config.kafka.kafka_hosts,
        &config.consumer_group,
        &[LISTING_INGESTED_TOPIC],
    )
    .expect("failed to create listing consumer");
    let listing_liveness = liveness.register("listing-consumer", time::Duration::seconds(30));
    tokio::spawn(run_listing_consumer(
        listing_consumer,
        processor,
        listing_liveness,
    ));

    let credential_consumer = kafka::create_consumer(
        &config.kafka.kafka_hosts,
        &config.consumer_group,
        &[CREDENTIAL_REQUESTED_TOPIC],
    )
    .expect("failed to create credential consumer");
    let credential_liveness = liveness.register("credential-consumer", time::Duration::seconds(30));
    tokio::spawn(run_credential_consumer(
        credential_consumer,
        admin.clone(),
        credential_liveness,
    ));

    let poller_liveness = liveness.register("update-poller", time::Duration::seconds(120));
    tokio::spawn(run_update_poller(
        bot,
        admin,
        config.admin_chat_id,
        poller_liveness,
    ));

    let bind = config.bind();
    tracing::info!("listening on {}", bind);

    let status = liveness.clone();
    let router = setup_metrics_router()
        .route("/_liveness", get(move || std::future::ready(status.get_status())));
    serve(router, &bind)
        .await
        .expect("failed to start serving metrics");
}
