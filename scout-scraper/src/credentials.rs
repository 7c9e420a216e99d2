use sqlx::postgres::PgPool;
use uuid::Uuid;

use scout_common::store::{connect_pool, StoreError, StoreResult};

/// Lifecycle of a credential request: created as `Pending` by the scraper,
/// moved to `Answered` when the administrator's code arrives, or to
/// `Expired` by the timeout watchdog. Both transitions are one-way and
/// guarded in SQL, so duplicate broker deliveries are no-ops.
#[derive(Debug, PartialEq, Clone, Copy, sqlx::Type)]
#[sqlx(type_name = "credential_status")]
#[sqlx(rename_all = "lowercase")]
pub enum CredentialStatus {
    Pending,
    Answered,
    Expired,
}

/// Persisted state machine backing the credential relay. Survives restarts
/// of either service; in-process waiters only hold the oneshot side.
#[derive(Clone)]
pub struct CredentialStore {
    pool: PgPool,
}

impl CredentialStore {
    pub fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        Ok(Self {
            pool: connect_pool(url, max_connections)?,
        })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_pending(
        &self,
        request_id: Uuid,
        session_id: &str,
        hint: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO credential_requests (request_id, session_id, hint) VALUES ($1, $2, $3)"#,
        )
        .bind(request_id)
        .bind(session_id)
        .bind(hint)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        Ok(())
    }

    /// Record the administrator's code. Returns false when the request is no
    /// longer pending (already answered, or expired before the code arrived),
    /// in which case the code must be dropped.
    pub async fn answer(&self, request_id: Uuid, code: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
UPDATE credential_requests
SET status = 'answered', code = $2, answered_at = NOW()
WHERE request_id = $1 AND status = 'pending'
            "#,
        )
        .bind(request_id)
        .bind(code)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(result.rows_affected() == 1)
    }

    /// Expire a request whose wait window elapsed. Returns false when an
    /// answer won the race.
    pub async fn expire(&self, request_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"UPDATE credential_requests SET status = 'expired' WHERE request_id = $1 AND status = 'pending'"#,
        )
        .bind(request_id)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn status(&self, request_id: Uuid) -> StoreResult<Option<CredentialStatus>> {
        let status = sqlx::query_scalar(
            r#"SELECT status FROM credential_requests WHERE request_id = $1"#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        Ok(status)
    }

    /// Archive consumed requests: anything answered or expired more than
    /// `days` days ago is deleted.
    pub async fn purge_finished_older_than(&self, days: u32) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
DELETE FROM credential_requests
WHERE status <> 'pending' AND issued_at < NOW() - make_interval(days => $1)
            "#,
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
