use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::warn;

use scout_common::store::{connect_pool, StoreError, StoreResult};

/// One user-defined search filter. Unset bounds always pass; empty sets are
/// treated as unconstrained.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct UserFilter {
    pub id: i64,
    pub user_id: i64,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub rooms: Option<Vec<i32>>,
    pub cities: Option<Vec<String>>,
    pub min_area_sqm: Option<f32>,
}

/// Where active filters come from. The bot UI collaborator owns writes; the
/// matcher only ever reads.
#[async_trait]
pub trait FilterSource: Send + Sync {
    async fn active_filters(&self) -> StoreResult<Vec<UserFilter>>;
}

#[derive(Clone)]
pub struct FilterStore {
    pool: PgPool,
}

impl FilterStore {
    pub fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        Ok(Self {
            pool: connect_pool(url, max_connections)?,
        })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FilterSource for FilterStore {
    async fn active_filters(&self) -> StoreResult<Vec<UserFilter>> {
        sqlx::query_as(
            r#"
SELECT id, user_id, min_price, max_price, rooms, cities, min_area_sqm
FROM user_filters
WHERE active
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }
}

struct CacheEntry {
    fetched_at: Instant,
    filters: Arc<Vec<UserFilter>>,
}

/// Short-TTL read-through cache over the filter store, so a burst of
/// ingested listings does not turn into a burst of filter queries. The
/// matcher itself stays stateless; this is the only state in the read path.
pub struct CachedFilters {
    source: Arc<dyn FilterSource>,
    ttl: Duration,
    cached: RwLock<Option<CacheEntry>>,
}

impl CachedFilters {
    pub fn new(source: Arc<dyn FilterSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cached: RwLock::new(None),
        }
    }

    pub async fn get(&self) -> StoreResult<Arc<Vec<UserFilter>>> {
        if let Some(entry) = self.cached.read().await.as_ref() {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.filters.clone());
            }
        }

        let mut cached = self.cached.write().await;
        // Lost the write race: somebody else may have refreshed already.
        if let Some(entry) = cached.as_ref() {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.filters.clone());
            }
        }

        match self.source.active_filters().await {
            Ok(filters) => {
                let filters = Arc::new(filters);
                *cached = Some(CacheEntry {
                    fetched_at: Instant::now(),
                    filters: filters.clone(),
                });
                Ok(filters)
            }
            Err(error) => match cached.as_ref() {
                // A stale filter set beats dropping the listing on the floor.
                Some(entry) => {
                    warn!("serving stale filters, refresh failed: {}", error);
                    Ok(entry.filters.clone())
                }
                None => Err(error),
            },
        }
    }
}
