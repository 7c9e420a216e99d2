use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use tracing::debug;

use scout_common::listing::{Listing, RawListing};
pub use scout_common::store::{StoreError, StoreResult};
use scout_common::store::{connect_pool, is_unique_violation};

/// Result of feeding one scraped listing through deduplication.
/// Only `New` listings flow further down the notification pipeline; `Updated`
/// refreshes the stored row without re-notifying (product decision, see
/// DESIGN.md) and `Unchanged` performs no write at all.
#[derive(Debug, PartialEq)]
pub enum IngestOutcome {
    New(Listing),
    Updated(Listing),
    Unchanged,
}

const INGEST_QUERY: &str = r#"
INSERT INTO listings
    (source, external_id, url, price, rooms, city, location, area_sqm, raw_text, enrichment, content_hash)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
ON CONFLICT ON CONSTRAINT listings_source_external_id_key DO UPDATE
SET
    url = EXCLUDED.url,
    price = EXCLUDED.price,
    rooms = EXCLUDED.rooms,
    city = EXCLUDED.city,
    location = EXCLUDED.location,
    area_sqm = EXCLUDED.area_sqm,
    raw_text = EXCLUDED.raw_text,
    enrichment = EXCLUDED.enrichment,
    content_hash = EXCLUDED.content_hash,
    last_seen_at = NOW()
WHERE
    listings.content_hash IS DISTINCT FROM EXCLUDED.content_hash
RETURNING
    listings.id, listings.first_seen_at, (xmax = 0) AS inserted
"#;

#[derive(sqlx::FromRow)]
struct IngestRow {
    id: i64,
    first_seen_at: DateTime<Utc>,
    inserted: bool,
}

/// The deduplicated record of every listing ever seen, keyed by
/// (source, external_id).
#[derive(Clone)]
pub struct ListingStore {
    pool: PgPool,
}

impl ListingStore {
    pub fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        Ok(Self {
            pool: connect_pool(url, max_connections)?,
        })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert one scraped listing, keyed by (source, external_id).
    ///
    /// The whole decision is a single statement so that concurrent ingestion
    /// of the same external id cannot create duplicate rows: an unseen key
    /// inserts (`New`), a seen key with a different content hash updates in
    /// place (`Updated`), and an identical row matches the conflict arm's
    /// WHERE clause, writes nothing and returns `Unchanged`. The rare unique
    /// violation raced between two first-time inserts is retried once.
    pub async fn ingest(&self, raw: &RawListing) -> StoreResult<IngestOutcome> {
        let mut conflict_retries = 0;
        loop {
            match self.try_ingest(raw).await {
                Err(StoreError::QueryError { command, error })
                    if conflict_retries == 0 && is_unique_violation(&error) =>
                {
                    debug!("retrying listing upsert after conflict: {}", command);
                    conflict_retries += 1;
                }
                result => return result,
            }
        }
    }

    async fn try_ingest(&self, raw: &RawListing) -> StoreResult<IngestOutcome> {
        let row: Option<IngestRow> = sqlx::query_as(INGEST_QUERY)
            .bind(raw.source.to_string())
            .bind(&raw.external_id)
            .bind(&raw.url)
            .bind(raw.price)
            .bind(raw.rooms)
            .bind(&raw.city)
            .bind(&raw.location)
            .bind(raw.area_sqm)
            .bind(&raw.raw_text)
            .bind(&raw.enrichment)
            .bind(raw.content_hash())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        let outcome = match row {
            None => IngestOutcome::Unchanged,
            Some(row) => {
                let listing = Listing {
                    id: row.id,
                    source: raw.source,
                    external_id: raw.external_id.clone(),
                    url: raw.url.clone(),
                    price: raw.price,
                    rooms: raw.rooms,
                    city: raw.city.clone(),
                    location: raw.location.clone(),
                    area_sqm: raw.area_sqm,
                    raw_text: raw.raw_text.clone(),
                    enrichment: raw.enrichment.clone(),
                    first_seen_at: row.first_seen_at,
                };
                if row.inserted {
                    IngestOutcome::New(listing)
                } else {
                    IngestOutcome::Updated(listing)
                }
            }
        };

        Ok(outcome)
    }

    /// Delete listings first seen more than `days` days ago. Returns the
    /// number of purged rows.
    pub async fn purge_older_than(&self, days: u32) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"DELETE FROM listings WHERE first_seen_at < NOW() - make_interval(days => $1)"#,
        )
        .bind(days as i32)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "DELETE".to_owned(),
            error,
        })?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scout_common::listing::Source;
    use sqlx::PgPool;

    fn raw_listing(external_id: &str, price: i64) -> RawListing {
        RawListing {
            source: Source::Krisha,
            external_id: external_id.to_owned(),
            url: Some(format!("https://krisha.kz/a/show/{}", external_id)),
            price: Some(price),
            rooms: Some(2),
            city: Some("almaty".to_owned()),
            location: Some("Abay Ave 10".to_owned()),
            area_sqm: Some(45.0),
            raw_text: "2-room apartment".to_owned(),
            enrichment: None,
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn first_ingest_is_new(db: PgPool) {
        let store = ListingStore::new_from_pool(db);

        match store.ingest(&raw_listing("123", 150_000)).await.unwrap() {
            IngestOutcome::New(listing) => {
                assert_eq!(listing.external_id, "123");
                assert_eq!(listing.price, Some(150_000));
            }
            other => panic!("expected New, got {:?}", other),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn identical_reingest_is_unchanged(db: PgPool) {
        let store = ListingStore::new_from_pool(db);

        let raw = raw_listing("123", 150_000);
        assert!(matches!(
            store.ingest(&raw).await.unwrap(),
            IngestOutcome::New(_)
        ));
        assert_eq!(store.ingest(&raw).await.unwrap(), IngestOutcome::Unchanged);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn changed_content_updates_in_place(db: PgPool) {
        let store = ListingStore::new_from_pool(db);

        let first = match store.ingest(&raw_listing("123", 150_000)).await.unwrap() {
            IngestOutcome::New(listing) => listing,
            other => panic!("expected New, got {:?}", other),
        };

        match store.ingest(&raw_listing("123", 140_000)).await.unwrap() {
            IngestOutcome::Updated(listing) => {
                // Same row, no duplicate.
                assert_eq!(listing.id, first.id);
                assert_eq!(listing.price, Some(140_000));
            }
            other => panic!("expected Updated, got {:?}", other),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn same_external_id_in_other_source_is_separate(db: PgPool) {
        let store = ListingStore::new_from_pool(db);

        let mut community = raw_listing("123", 150_000);
        community.source = Source::Community(1002345);

        assert!(matches!(
            store.ingest(&raw_listing("123", 150_000)).await.unwrap(),
            IngestOutcome::New(_)
        ));
        assert!(matches!(
            store.ingest(&community).await.unwrap(),
            IngestOutcome::New(_)
        ));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn purge_removes_only_old_rows(db: PgPool) {
        let store = ListingStore::new_from_pool(db.clone());

        assert!(matches!(
            store.ingest(&raw_listing("123", 150_000)).await.unwrap(),
            IngestOutcome::New(_)
        ));
        sqlx::query("UPDATE listings SET first_seen_at = NOW() - INTERVAL '10 days'")
            .execute(&db)
            .await
            .unwrap();
        assert!(matches!(
            store.ingest(&raw_listing("456", 90_000)).await.unwrap(),
            IngestOutcome::New(_)
        ));

        assert_eq!(store.purge_older_than(3).await.unwrap(), 1);
    }
}
