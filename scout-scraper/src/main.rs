//! Scraper orchestrator: drives the collectors on their schedules,
//! deduplicates their output and publishes new listings for the notifier.
use std::sync::Arc;

use axum::routing::get;
use envconfig::Envconfig;
use health::HealthRegistry;

use scout_common::kafka::{self, KafkaPublisher, PrintPublisher, Publisher};
use scout_common::messages::CREDENTIAL_ANSWERED_TOPIC;
use scout_common::metrics::{serve, setup_metrics_router};
use scout_scraper::collectors::community::{CommunityCollector, HttpChannelSession};
use scout_scraper::collectors::krisha::KrishaCollector;
use scout_scraper::collectors::Collector;
use scout_scraper::config::Config;
use scout_scraper::credentials::CredentialStore;
use scout_scraper::enrich::{Enricher, HttpEnricher, NoopEnricher};
use scout_scraper::orchestrator::{run_collector, run_retention, Pipeline};
use scout_scraper::relay::{run_answer_consumer, CredentialRelay};
use scout_scraper::store::ListingStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    let liveness = HealthRegistry::new("liveness");

    let listings = ListingStore::new(&config.database_url, config.max_pg_connections)
        .expect("failed to initialize listing store");
    let credentials = CredentialStore::new(&config.database_url, config.max_pg_connections)
        .expect("failed to initialize credential store");

    let publisher: Arc<dyn Publisher> = if config.print_broker {
        Arc::new(PrintPublisher {})
    } else {
        let producer_liveness = liveness.register("rdkafka", time::Duration::seconds(30));
        let producer = kafka::create_producer(&config.kafka, producer_liveness)
            .expect("failed to create kafka producer");
        Arc::new(KafkaPublisher::new(producer))
    };

    let relay = Arc::new(CredentialRelay::new(
        credentials.clone(),
        publisher.clone(),
        config.credential_wait.0,
    ));

    let enricher: Arc<dyn Enricher> = match &config.enrichment_url {
        Some(url) => Arc::new(HttpEnricher::new(
            url.clone(),
            std::time::Duration::from_secs(30),
        )),
        None => Arc::new(NoopEnricher {}),
    };
    let pipeline = Arc::new(Pipeline::new(
        listings.clone(),
        enricher,
        publisher.clone(),
    ));

    let mut collectors: Vec<Arc<dyn Collector>> = vec![Arc::new(KrishaCollector::new(
        config.krisha_base_url.clone(),
        config.krisha_search_path.clone(),
        config.krisha_city.clone(),
        config.krisha_interval.0,
    ))];
    if !config.community_channels.0.is_empty() {
        let session = Arc::new(HttpChannelSession::new(config.session_service_url.clone()));
        collectors.push(Arc::new(CommunityCollector::new(
            session,
            relay.clone(),
            config.session_id.clone(),
            config.community_channels.0.clone(),
            config.community_interval.0,
        )));
    }

    for collector in collectors {
        // A collector is stalled once it misses three of its own intervals.
        let deadline = time::Duration::seconds((collector.interval().as_secs() as i64 * 3).max(60));
        let handle = liveness.register(collector.name(), deadline);
        tokio::spawn(run_collector(collector, pipeline.clone(), handle));
    }

    if !config.print_broker {
        let consumer = kafka::create_consumer(
            &config.kafka.kafka_hosts,
            "scout-scraper",
            &[CREDENTIAL_ANSWERED_TOPIC],
        )
        .expect("failed to create credential answer consumer");
        let handle = liveness.register("credential-answers", time::Duration::seconds(30));
        tokio::spawn(run_answer_consumer(consumer, relay.clone(), handle));
    }

    let retention_liveness = liveness.register("retention", time::Duration::days(2));
    tokio::spawn(run_retention(
        listings,
        credentials,
        config.retention_days,
        retention_liveness,
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
