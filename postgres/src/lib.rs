//! `PostgreSQL` storage for the Sequent engine.
//!
//! This crate provides durable implementations of the two storage contracts
//! from `sequent-core`:
//!
//! - [`PostgresEventLog`]: per-aggregate versioned event streams with unique
//!   `(aggregate_id, version)` and `(aggregate_id, command_id)` keys
//! - [`PostgresCheckpointStore`]: last dispatched version per processor and
//!   aggregate, advanced by conditional update
//!
//! Both share one migration set, applied with [`migrate`].
//!
//! # Example
//!
//! ```ignore
//! use sequent_postgres::{PostgresCheckpointStore, PostgresEventLog, migrate};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let log = PostgresEventLog::new("postgres://localhost/sequent").await?;
//!     migrate(log.pool()).await?;
//!     let checkpoints = PostgresCheckpointStore::from_pool(log.pool().clone());
//!     Ok(())
//! }
//! ```

mod checkpoint;
mod event_log;

pub use checkpoint::PostgresCheckpointStore;
pub use event_log::PostgresEventLog;

use sequent_core::Version;
use sqlx::PgPool;
use sqlx::migrate::{MigrateError, Migrator};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Create the `event_streams` and `published_versions` tables if missing.
///
/// # Errors
///
/// Returns [`MigrateError`] if a migration fails to apply.
pub async fn migrate(pool: &PgPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await?;
    tracing::info!("Sequent migrations applied");
    Ok(())
}

/// Versions are stored as `BIGINT`; anything past `i64::MAX` saturates.
pub(crate) fn version_to_db(version: Version) -> i64 {
    i64::try_from(version.value()).unwrap_or(i64::MAX)
}

/// Negative values never pass the table's `CHECK` constraint; treat them as 0.
pub(crate) fn version_from_db(value: i64) -> Version {
    Version::new(u64::try_from(value).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_convert_at_the_edges() {
        assert_eq!(version_to_db(Version::new(7)), 7);
        assert_eq!(version_to_db(Version::new(u64::MAX)), i64::MAX);
        assert_eq!(version_from_db(7), Version::new(7));
        assert_eq!(version_from_db(-1), Version::INITIAL);
    }
}
