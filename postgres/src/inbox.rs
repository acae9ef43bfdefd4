//! `PostgreSQL` inbox.

use crate::database_error;
use chrono::{DateTime, Utc};
use reliable_events_core::inbox::{InboxEntry, InboxStore, RecordOutcome};
use reliable_events_core::message::MessageId;
use reliable_events_core::persistence::PersistenceError;
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;
use std::pin::Pin;

/// `PostgreSQL` inbox.
///
/// `record` is an `INSERT ... ON CONFLICT DO NOTHING` on the `message_id` primary key.
/// A second transaction inserting the same id blocks on the first one's row lock and
/// then sees either the committed row (duplicate) or nothing (the first rolled back).
///
/// Handlers receive the same [`sqlx::Transaction`] and write their effects through it.
#[derive(Debug, Clone)]
pub struct PostgresInbox {
    pool: PgPool,
}

impl PostgresInbox {
    /// Create an inbox over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl InboxStore for PostgresInbox {
    type Transaction = Transaction<'static, Postgres>;

    fn begin(&self) -> Pin<Box<dyn Future<Output = Result<Self::Transaction, PersistenceError>> + Send + '_>> {
        Box::pin(async move { self.pool.begin().await.map_err(database_error) })
    }

    fn record<'a>(
        &'a self,
        tx: &'a mut Self::Transaction,
        entry: &'a InboxEntry,
    ) -> Pin<Box<dyn Future<Output = Result<RecordOutcome, PersistenceError>> + Send + 'a>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO inbox (message_id, event_type, processed_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (message_id) DO NOTHING
                ",
            )
            .bind(*entry.message_id.as_uuid())
            .bind(&entry.event_type)
            .bind(entry.processed_at)
            .execute(&mut **tx)
            .await
            .map_err(database_error)?;

            Ok(if result.rows_affected() == 1 {
                RecordOutcome::Recorded
            } else {
                RecordOutcome::Duplicate
            })
        })
    }

    fn contains(
        &self,
        message_id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let (exists,): (bool,) =
                sqlx::query_as("SELECT EXISTS (SELECT 1 FROM inbox WHERE message_id = $1)")
                    .bind(*message_id.as_uuid())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(database_error)?;
            Ok(exists)
        })
    }

    fn commit(
        &self,
        tx: Self::Transaction,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        Box::pin(async move { tx.commit().await.map_err(database_error) })
    }

    fn rollback(
        &self,
        tx: Self::Transaction,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        Box::pin(async move { tx.rollback().await.map_err(database_error) })
    }

    fn purge_processed(
        &self,
        older_than: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM inbox WHERE processed_at < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await
                .map_err(database_error)?;
            Ok(result.rows_affected())
        })
    }
}
