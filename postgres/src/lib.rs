//! `PostgreSQL` storage for the reliable events bridge.
//!
//! - [`PostgresOutbox`]: transactional outbox with lease-based claiming
//!   (`FOR UPDATE SKIP LOCKED`)
//! - [`PostgresInbox`]: idempotency records (`ON CONFLICT DO NOTHING`)
//! - [`DeadLetterQueue`]: dead-letter sink with operator workflows
//!
//! All three share one [`PgPool`] and the schema in `migrations/`.
//!
//! # Example
//!
//! ```ignore
//! use reliable_events_postgres::{PostgresOutbox, connect, migrate};
//!
//! async fn example(config: &BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect(&config.database).await?;
//!     migrate(&pool).await?;
//!
//!     let outbox = PostgresOutbox::new(pool.clone());
//!     let mut tx = outbox.begin().await?;
//!     // ... domain writes on &mut *tx ...
//!     outbox.append(&mut tx, entry).await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dead_letter_queue;
mod inbox;
mod outbox;

pub use dead_letter_queue::{DeadLetterQueue, DeadLetterStatus, StoredDeadLetter};
pub use inbox::PostgresInbox;
pub use outbox::PostgresOutbox;

use reliable_events_core::config::DatabaseSettings;
use reliable_events_core::persistence::PersistenceError;
use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;

/// Embedded schema migrations.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Open a connection pool from the bridge database settings.
///
/// # Errors
///
/// Returns [`PersistenceError::DatabaseError`] if the database is unreachable.
pub async fn connect(settings: &DatabaseSettings) -> Result<PgPool, PersistenceError> {
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(&settings.url)
        .await
        .map_err(database_error)
}

/// Apply pending schema migrations.
///
/// # Errors
///
/// Returns [`PersistenceError::DatabaseError`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), PersistenceError> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| PersistenceError::DatabaseError(format!("migration failed: {e}")))?;
    tracing::info!("Database migrations applied");
    Ok(())
}

/// Map a driver error; serialization failures and deadlocks are retryable conflicts.
pub(crate) fn database_error(e: sqlx::Error) -> PersistenceError {
    if let sqlx::Error::Database(db) = &e {
        if matches!(db.code().as_deref(), Some("40001" | "40P01")) {
            return PersistenceError::Conflict(db.message().to_string());
        }
    }
    PersistenceError::DatabaseError(e.to_string())
}

#[allow(clippy::cast_possible_wrap)] // Batch and page sizes are small
pub(crate) const fn sql_limit(limit: usize) -> i64 {
    limit as i64
}
