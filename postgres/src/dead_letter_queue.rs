//! Dead-letter queue for inbound messages.
//!
//! Persistent storage for messages the receiver could not process and will never be
//! able to: unknown event types, schema mismatches, terminal handler errors and
//! messages that exhausted their deliveries. Operators list, inspect and then resolve
//! or discard each entry.

use crate::{database_error, sql_limit};
use chrono::{DateTime, Utc};
use reliable_events_core::dead_letter::{DeadLetter, DeadLetterSink};
use reliable_events_core::message::MessageId;
use reliable_events_core::persistence::PersistenceError;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// Operator status of a dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterStatus {
    /// Awaiting investigation
    Pending,
    /// Fixed and replayed (or otherwise handled)
    Resolved,
    /// Permanently dropped
    Discarded,
}

impl DeadLetterStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::CorruptRecord`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, PersistenceError> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(PersistenceError::CorruptRecord(format!(
                "Invalid dead letter status: {s}"
            ))),
        }
    }
}

/// A dead letter as stored, with its operator workflow columns.
#[derive(Debug, Clone)]
pub struct StoredDeadLetter {
    /// Row id
    pub id: i64,

    /// The message as it was received
    pub letter: DeadLetter,

    /// Current operator status
    pub status: DeadLetterStatus,

    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who resolved it
    pub resolved_by: Option<String>,

    /// Resolution or discard notes
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-based dead-letter queue.
///
/// # Example
///
/// ```no_run
/// use reliable_events_postgres::DeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// for stored in dlq.list_pending(100).await? {
///     println!("{}: {}", stored.letter.event_type, stored.letter.failure_reason);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a new dead-letter queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store a dead letter and return its row id.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::DatabaseError`] if the insert fails.
    pub async fn add(&self, letter: &DeadLetter) -> Result<i64, PersistenceError> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO dead_letters (
                message_id, event_type, topic, body, failure_reason, attempts, received_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            ",
        )
        .bind(*letter.message_id.as_uuid())
        .bind(&letter.event_type)
        .bind(&letter.topic)
        .bind(&letter.body)
        .bind(&letter.failure_reason)
        .bind(i32::try_from(letter.attempts).unwrap_or(i32::MAX))
        .bind(letter.received_at)
        .fetch_one(&self.pool)
        .await
        .map_err(database_error)?;

        tracing::warn!(
            dlq_id = id,
            message_id = %letter.message_id,
            event_type = %letter.event_type,
            reason = %letter.failure_reason,
            attempts = letter.attempts,
            "Message added to dead-letter queue"
        );

        metrics::counter!("dead_letter_added_total", "event_type" => letter.event_type.clone())
            .increment(1);

        Ok(id)
    }

    /// List pending dead letters, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<StoredDeadLetter>, PersistenceError> {
        self.list_by_status(DeadLetterStatus::Pending, limit).await
    }

    /// List dead letters by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DeadLetterStatus,
        limit: usize,
    ) -> Result<Vec<StoredDeadLetter>, PersistenceError> {
        let rows = sqlx::query(
            r"
            SELECT
                id, message_id, event_type, topic, body, failure_reason, attempts,
                received_at, status, resolved_at, resolved_by, resolution_notes
            FROM dead_letters
            WHERE status = $1
            ORDER BY received_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;

        rows.iter().map(Self::row_to_stored).collect()
    }

    /// Get a specific dead letter by row id.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::NotFound`] if no such row exists.
    pub async fn get_by_id(&self, id: i64) -> Result<StoredDeadLetter, PersistenceError> {
        let row = sqlx::query(
            r"
            SELECT
                id, message_id, event_type, topic, body, failure_reason, attempts,
                received_at, status, resolved_at, resolved_by, resolution_notes
            FROM dead_letters
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error)?
        .ok_or_else(|| PersistenceError::NotFound(format!("dead letter {id}")))?;

        Self::row_to_stored(&row)
    }

    /// Mark a dead letter as resolved.
    ///
    /// # Arguments
    ///
    /// * `id` - The row id
    /// * `resolved_by` - Who resolved it (e.g., username, service name)
    /// * `notes` - What was done
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::NotFound`] if no such row exists.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(database_error)?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound(format!("dead letter {id}")));
        }

        tracing::info!(dlq_id = id, resolved_by = resolved_by, "Dead letter marked as resolved");
        metrics::counter!("dead_letter_resolved_total").increment(1);
        Ok(())
    }

    /// Mark a dead letter as discarded.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::NotFound`] if no such row exists.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(database_error)?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound(format!("dead letter {id}")));
        }

        tracing::warn!(dlq_id = id, reason = reason, "Dead letter discarded");
        metrics::counter!("dead_letter_discarded_total").increment(1);
        Ok(())
    }

    /// Number of pending dead letters. Also sets the `dead_letter_pending` gauge.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, PersistenceError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dead_letters WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(database_error)?;

        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("dead_letter_pending").set(count as f64);
        Ok(count)
    }

    fn row_to_stored(row: &sqlx::postgres::PgRow) -> Result<StoredDeadLetter, PersistenceError> {
        let status: String = row.get("status");
        let attempts: i32 = row.get("attempts");

        Ok(StoredDeadLetter {
            id: row.get("id"),
            letter: DeadLetter {
                message_id: MessageId::from_uuid(row.get("message_id")),
                event_type: row.get("event_type"),
                body: row.get("body"),
                failure_reason: row.get("failure_reason"),
                received_at: row.get("received_at"),
                topic: row.get("topic"),
                attempts: u32::try_from(attempts)
                    .map_err(|_| PersistenceError::CorruptRecord(format!("attempts {attempts}")))?,
            },
            status: DeadLetterStatus::parse(&status)?,
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn send<'a>(
        &'a self,
        dead_letter: &'a DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + 'a>> {
        Box::pin(async move { self.add(dead_letter).await.map(|_| ()) })
    }
}
