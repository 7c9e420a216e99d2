use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::{counter, histogram};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use scout_common::kafka::{publish_json, Publisher};
use scout_common::listing::RawListing;
use scout_common::messages::{ListingIngested, LISTING_INGESTED_TOPIC};

use crate::collectors::Collector;
use crate::credentials::CredentialStore;
use crate::enrich::Enricher;
use crate::store::{IngestOutcome, ListingStore, StoreError};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// The ingestion stage between collectors and the broker: enrich, dedupe
/// through the listing store, publish whatever came out new.
pub struct Pipeline {
    store: ListingStore,
    enricher: Arc<dyn Enricher>,
    publisher: Arc<dyn Publisher>,
}

impl Pipeline {
    pub fn new(
        store: ListingStore,
        enricher: Arc<dyn Enricher>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            store,
            enricher,
            publisher,
        }
    }

    pub async fn ingest_batch(&self, listings: Vec<RawListing>) -> Result<IngestStats, StoreError> {
        let mut stats = IngestStats::default();

        for mut raw in listings {
            if raw.enrichment.is_none() {
                match self.enricher.enrich(&raw).await {
                    Ok(enrichment) => raw.enrichment = enrichment,
                    // Enrichment is optional, the listing proceeds bare.
                    Err(e) => warn!(
                        external_id = %raw.external_id,
                        "enrichment failed: {}", e
                    ),
                }
            }

            match self.store.ingest(&raw).await? {
                IngestOutcome::New(listing) => {
                    stats.new += 1;
                    counter!("scout_listings_ingested_total", &[("outcome", "new")]).increment(1);

                    let key = listing.source.to_string();
                    let message = ListingIngested { listing };
                    if let Err(e) = publish_json(
                        self.publisher.as_ref(),
                        LISTING_INGESTED_TOPIC,
                        Some(&key),
                        &message,
                    )
                    .await
                    {
                        counter!("scout_listings_publish_errors_total").increment(1);
                        error!(
                            external_id = %message.listing.external_id,
                            "failed to publish ingested listing: {}", e
                        );
                    }
                }
                IngestOutcome::Updated(listing) => {
                    stats.updated += 1;
                    counter!("scout_listings_ingested_total", &[("outcome", "updated")])
                        .increment(1);
                    // Updated listings refresh the row but do not re-notify.
                    info!(
                        external_id = %listing.external_id,
                        "listing content changed since last scrape"
                    );
                }
                IngestOutcome::Unchanged => {
                    stats.unchanged += 1;
                    counter!("scout_listings_ingested_total", &[("outcome", "unchanged")])
                        .increment(1);
                }
            }
        }

        Ok(stats)
    }
}

/// Drive one collector on its own schedule forever. Failures are contained
/// to the run that hit them; the next tick starts fresh.
pub async fn run_collector(
    collector: Arc<dyn Collector>,
    pipeline: Arc<Pipeline>,
    liveness: HealthHandle,
) {
    let mut interval = tokio::time::interval(collector.interval());
    // A run longer than the interval delays the next one instead of bursting.
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        liveness.report_healthy();

        let labels = [("collector", collector.name().to_owned())];
        let started = tokio::time::Instant::now();

        match collector.collect().await {
            Ok(listings) => {
                let fetched = listings.len();
                match pipeline.ingest_batch(listings).await {
                    Ok(stats) => {
                        counter!("scout_collector_runs_total", &labels).increment(1);
                        info!(
                            collector = collector.name(),
                            fetched = fetched,
                            new = stats.new,
                            updated = stats.updated,
                            unchanged = stats.unchanged,
                            "collector run finished"
                        );
                    }
                    Err(e) => {
                        counter!("scout_collector_failures_total", &labels).increment(1);
                        error!(collector = collector.name(), "ingestion failed: {}", e);
                    }
                }
            }
            Err(e) => {
                counter!("scout_collector_failures_total", &labels).increment(1);
                error!(collector = collector.name(), "collector run failed: {}", e);
            }
        }

        histogram!("scout_collector_run_duration_seconds", &labels)
            .record(started.elapsed().as_secs_f64());
    }
}

/// Daily retention pass over listings and consumed credential requests.
pub async fn run_retention(
    listings: ListingStore,
    credentials: CredentialStore,
    retention_days: u32,
    liveness: HealthHandle,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        liveness.report_healthy();

        match listings.purge_older_than(retention_days).await {
            Ok(purged) => info!(purged = purged, "purged old listings"),
            Err(e) => error!("listing retention pass failed: {}", e),
        }
        match credentials.purge_finished_older_than(retention_days).await {
            Ok(purged) => info!(purged = purged, "purged consumed credential requests"),
            Err(e) => error!("credential retention pass failed: {}", e),
        }
    }
}
