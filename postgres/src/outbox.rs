//! `PostgreSQL` transactional outbox.

use crate::{database_error, sql_limit};
use chrono::{DateTime, Utc};
use reliable_events_core::backoff::BackoffPolicy;
use reliable_events_core::environment::{Clock, SystemClock};
use reliable_events_core::outbox::{
    EventMetadata, NewOutboxEntry, OutboxEntry, OutboxId, OutboxStats, OutboxStatus, OutboxStore,
    TransactionalOutbox,
};
use reliable_events_core::persistence::PersistenceError;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Key for `pg_advisory_xact_lock`, serializing claims across dispatchers.
const CLAIM_LOCK_KEY: i64 = 0x6f75_7462_6f78; // "outbox"

const ENTRY_COLUMNS: &str = "id, event_type, aggregate_id, payload, occurred_at, correlation_id, \
     causation_id, status, attempt_count, last_error, next_attempt_at, lease_owner, \
     lease_expires_at, published_at";

/// `PostgreSQL` outbox.
///
/// Appends go through the caller's [`sqlx::Transaction`] so they commit with the domain
/// write. Everything else is dispatcher-side and uses the pool.
///
/// # Claiming
///
/// `claim_batch` takes a transaction-scoped advisory lock before selecting, so claims
/// run one at a time and always observe each other's leases. Without it, a row skipped
/// under `SKIP LOCKED` would look unleased and let a later entry of the same aggregate
/// through.
#[derive(Clone)]
pub struct PostgresOutbox {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresOutbox {
    /// Create an outbox over an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a specific clock for lease and retry timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Start a transaction for a domain write plus outbox append.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::DatabaseError`] if no connection is available.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, PersistenceError> {
        self.pool.begin().await.map_err(database_error)
    }

    /// Load one entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::NotFound`] for an unknown id.
    pub async fn get(&self, id: OutboxId) -> Result<OutboxEntry, PersistenceError> {
        let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM outbox WHERE id = $1"))
            .bind(id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(database_error)?
            .ok_or_else(|| PersistenceError::NotFound(format!("outbox entry {id}")))?;
        row_to_entry(&row)
    }

    /// Why a lease-conditioned update touched no row.
    async fn missing_or_lost(&self, id: OutboxId) -> PersistenceError {
        match self.get(id).await {
            Ok(_) => PersistenceError::LeaseLost(format!("outbox entry {id}")),
            Err(e) => e,
        }
    }
}

impl std::fmt::Debug for PostgresOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresOutbox").finish_non_exhaustive()
    }
}

impl TransactionalOutbox for PostgresOutbox {
    type Transaction = Transaction<'static, Postgres>;

    fn append<'a>(
        &'a self,
        tx: &'a mut Self::Transaction,
        entry: NewOutboxEntry,
    ) -> Pin<Box<dyn Future<Output = Result<OutboxId, PersistenceError>> + Send + 'a>> {
        Box::pin(async move {
            let now = self.clock.now();
            let occurred_at = entry.occurred_at.unwrap_or(now);

            let (id,): (i64,) = sqlx::query_as(
                r"
                INSERT INTO outbox (
                    event_type, aggregate_id, payload, occurred_at,
                    correlation_id, causation_id, status, next_attempt_at
                ) VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7)
                RETURNING id
                ",
            )
            .bind(&entry.event_type)
            .bind(&entry.aggregate_id)
            .bind(&entry.payload)
            .bind(occurred_at)
            .bind(&entry.metadata.correlation_id)
            .bind(&entry.metadata.causation_id)
            .bind(occurred_at.min(now))
            .fetch_one(&mut **tx)
            .await
            .map_err(database_error)?;

            tracing::trace!(
                outbox_id = id,
                event_type = %entry.event_type,
                aggregate_id = %entry.aggregate_id,
                "Outbox entry appended"
            );
            Ok(OutboxId::new(id))
        })
    }
}

impl OutboxStore for PostgresOutbox {
    fn claim_batch<'a>(
        &'a self,
        owner: &'a str,
        limit: usize,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>, PersistenceError>> + Send + 'a>>
    {
        Box::pin(async move {
            let now = self.clock.now();
            let expires = chrono::Duration::from_std(lease)
                .ok()
                .and_then(|lease| now.checked_add_signed(lease))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);

            let mut tx = self.pool.begin().await.map_err(database_error)?;
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(CLAIM_LOCK_KEY)
                .execute(&mut *tx)
                .await
                .map_err(database_error)?;

            // An entry is claimable when it is due, unleased, and no earlier undelivered
            // entry of its aggregate is waiting (not due or leased elsewhere). Earlier
            // claimable entries sort first, so they are in the same batch.
            let rows = sqlx::query(&format!(
                r"
                WITH candidates AS (
                    SELECT o.id
                    FROM outbox o
                    WHERE o.status IN ('pending', 'failed')
                      AND o.next_attempt_at <= $1
                      AND (o.lease_expires_at IS NULL OR o.lease_expires_at <= $1)
                      AND NOT EXISTS (
                          SELECT 1
                          FROM outbox p
                          WHERE p.aggregate_id = o.aggregate_id
                            AND p.status IN ('pending', 'failed')
                            AND (p.occurred_at, p.id) < (o.occurred_at, o.id)
                            AND (p.next_attempt_at > $1 OR p.lease_expires_at > $1)
                      )
                    ORDER BY o.occurred_at, o.id
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE outbox
                SET lease_owner = $3, lease_expires_at = $4
                FROM candidates
                WHERE outbox.id = candidates.id
                RETURNING {}
                ",
                qualified_columns()
            ))
            .bind(now)
            .bind(sql_limit(limit))
            .bind(owner)
            .bind(expires)
            .fetch_all(&mut *tx)
            .await
            .map_err(database_error)?;

            tx.commit().await.map_err(database_error)?;

            let mut entries = rows.iter().map(row_to_entry).collect::<Result<Vec<_>, _>>()?;
            entries.sort_by(|a, b| (a.occurred_at, a.id).cmp(&(b.occurred_at, b.id)));
            Ok(entries)
        })
    }

    fn mark_published<'a>(
        &'a self,
        owner: &'a str,
        ids: &'a [OutboxId],
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        Box::pin(async move {
            let raw: Vec<i64> = ids.iter().map(OutboxId::value).collect();
            let result = sqlx::query(
                r"
                UPDATE outbox
                SET status = 'published', published_at = $3,
                    lease_owner = NULL, lease_expires_at = NULL
                WHERE id = ANY($1) AND lease_owner = $2
                ",
            )
            .bind(&raw)
            .bind(owner)
            .bind(self.clock.now())
            .execute(&self.pool)
            .await
            .map_err(database_error)?;

            if result.rows_affected() < raw.len() as u64 {
                return Err(PersistenceError::LeaseLost(format!(
                    "{} of {} outbox entries no longer leased to {owner}",
                    raw.len() as u64 - result.rows_affected(),
                    raw.len()
                )));
            }
            Ok(())
        })
    }

    fn mark_failed<'a>(
        &'a self,
        owner: &'a str,
        id: OutboxId,
        error: &'a str,
        backoff: &'a BackoffPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(database_error)?;

            let (attempts, lease_owner): (i32, Option<String>) = sqlx::query_as(
                "SELECT attempt_count, lease_owner FROM outbox WHERE id = $1 FOR UPDATE",
            )
            .bind(id.value())
            .fetch_optional(&mut *tx)
            .await
            .map_err(database_error)?
            .ok_or_else(|| PersistenceError::NotFound(format!("outbox entry {id}")))?;

            if lease_owner.as_deref() != Some(owner) {
                return Err(PersistenceError::LeaseLost(format!("outbox entry {id}")));
            }

            let attempts = u32::try_from(attempts)
                .map_err(|_| PersistenceError::CorruptRecord(format!("attempt_count {attempts}")))?
                .saturating_add(1);
            let next_attempt_at = backoff.next_attempt_at(attempts, self.clock.now());

            sqlx::query(
                r"
                UPDATE outbox
                SET status = 'failed', attempt_count = $2, last_error = $3,
                    next_attempt_at = $4, lease_owner = NULL, lease_expires_at = NULL
                WHERE id = $1
                ",
            )
            .bind(id.value())
            .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
            .bind(error)
            .bind(next_attempt_at)
            .execute(&mut *tx)
            .await
            .map_err(database_error)?;

            tx.commit().await.map_err(database_error)
        })
    }

    fn mark_dead<'a>(
        &'a self,
        owner: &'a str,
        id: OutboxId,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE outbox
                SET status = 'dead', attempt_count = attempt_count + 1, last_error = $2,
                    lease_owner = NULL, lease_expires_at = NULL
                WHERE id = $1 AND lease_owner = $3
                ",
            )
            .bind(id.value())
            .bind(error)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(database_error)?;

            if result.rows_affected() == 0 {
                return Err(self.missing_or_lost(id).await);
            }
            Ok(())
        })
    }

    fn release<'a>(
        &'a self,
        owner: &'a str,
        ids: &'a [OutboxId],
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        Box::pin(async move {
            let ids: Vec<i64> = ids.iter().map(OutboxId::value).collect();
            sqlx::query(
                r"
                UPDATE outbox SET lease_owner = NULL, lease_expires_at = NULL
                WHERE id = ANY($1) AND lease_owner = $2
                ",
            )
            .bind(&ids)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(database_error)?;
            Ok(())
        })
    }

    fn stats(&self) -> Pin<Box<dyn Future<Output = Result<OutboxStats, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let rows: Vec<(String, i64)> =
                sqlx::query_as("SELECT status, COUNT(*) FROM outbox GROUP BY status")
                    .fetch_all(&self.pool)
                    .await
                    .map_err(database_error)?;

            let mut stats = OutboxStats::default();
            for (status, count) in rows {
                let count = u64::try_from(count).unwrap_or(0);
                match OutboxStatus::parse(&status) {
                    Some(OutboxStatus::Pending) => stats.pending = count,
                    Some(OutboxStatus::Failed) => stats.failed = count,
                    Some(OutboxStatus::Published) => stats.published = count,
                    Some(OutboxStatus::Dead) => stats.dead = count,
                    None => return Err(PersistenceError::CorruptRecord(format!("status '{status}'"))),
                }
            }
            Ok(stats)
        })
    }

    fn list_dead(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>, PersistenceError>> + Send + '_>>
    {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {ENTRY_COLUMNS} FROM outbox WHERE status = 'dead' \
                 ORDER BY occurred_at, id LIMIT $1"
            ))
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(database_error)?;

            rows.iter().map(row_to_entry).collect()
        })
    }

    fn requeue_dead(
        &self,
        id: OutboxId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE outbox
                SET status = 'pending', attempt_count = 0, next_attempt_at = $2
                WHERE id = $1 AND status = 'dead'
                ",
            )
            .bind(id.value())
            .bind(self.clock.now())
            .execute(&self.pool)
            .await
            .map_err(database_error)?;

            let requeued = result.rows_affected() == 1;
            if requeued {
                tracing::info!(outbox_id = %id, "Dead outbox entry requeued");
            }
            Ok(requeued)
        })
    }

    fn purge_published(
        &self,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                "DELETE FROM outbox WHERE status = 'published' AND published_at < $1",
            )
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(database_error)?;
            Ok(result.rows_affected())
        })
    }
}

fn qualified_columns() -> String {
    ENTRY_COLUMNS
        .split(',')
        .map(|column| format!("outbox.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_entry(row: &PgRow) -> Result<OutboxEntry, PersistenceError> {
    let status: String = row.get("status");
    let status = OutboxStatus::parse(&status)
        .ok_or_else(|| PersistenceError::CorruptRecord(format!("status '{status}'")))?;
    let attempts: i32 = row.get("attempt_count");

    Ok(OutboxEntry {
        id: OutboxId::new(row.get("id")),
        event_type: row.get("event_type"),
        aggregate_id: row.get("aggregate_id"),
        payload: row.get("payload"),
        occurred_at: row.get("occurred_at"),
        metadata: EventMetadata {
            correlation_id: row.get("correlation_id"),
            causation_id: row.get("causation_id"),
        },
        status,
        attempt_count: u32::try_from(attempts)
            .map_err(|_| PersistenceError::CorruptRecord(format!("attempt_count {attempts}")))?,
        last_error: row.get("last_error"),
        next_attempt_at: row.get("next_attempt_at"),
        lease_owner: row.get("lease_owner"),
        lease_expires_at: row.get("lease_expires_at"),
        published_at: row.get("published_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returning_clause_is_table_qualified() {
        let columns = qualified_columns();
        assert!(columns.starts_with("outbox.id, outbox.event_type"));
        assert!(columns.ends_with("outbox.published_at"));
        assert_eq!(columns.matches("outbox.").count(), ENTRY_COLUMNS.split(',').count());
    }
}
