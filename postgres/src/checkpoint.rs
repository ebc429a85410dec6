//! `PostgreSQL` checkpoint store.

use crate::{version_from_db, version_to_db};
use sequent_core::{CheckpointError, CheckpointKey, CheckpointStore, Version};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::pin::Pin;

/// Dispatch checkpoints in the `published_versions` table.
///
/// Version 1 is written with an insert that does nothing on conflict; every
/// later version is a conditional update guarded by `version = requested - 1`.
/// When no row changes, the stored version is read back and reported as
/// [`CheckpointError::Conflict`].
#[derive(Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    /// Connect to `database_url` with a pool of up to 10 connections.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::DatabaseError`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, CheckpointError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| CheckpointError::DatabaseError(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Use an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn stored_version(&self, key: &CheckpointKey) -> Result<Version, CheckpointError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r"
            SELECT version FROM published_versions
            WHERE processor_name = $1 AND aggregate_type = $2 AND aggregate_id = $3
            ",
        )
        .bind(&key.processor)
        .bind(&key.aggregate_type)
        .bind(key.aggregate_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CheckpointError::DatabaseError(e.to_string()))?;

        Ok(row.map_or(Version::INITIAL, |(version,)| version_from_db(version)))
    }

    async fn advance(&self, key: CheckpointKey, version: Version) -> Result<Version, CheckpointError> {
        let query = if version == Version::FIRST {
            sqlx::query(
                r"
                INSERT INTO published_versions (processor_name, aggregate_type, aggregate_id, version)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT DO NOTHING
                ",
            )
        } else {
            sqlx::query(
                r"
                UPDATE published_versions
                SET version = $4, updated_at = now()
                WHERE processor_name = $1 AND aggregate_type = $2 AND aggregate_id = $3
                  AND version = $4 - 1
                ",
            )
        };

        let affected = query
            .bind(&key.processor)
            .bind(&key.aggregate_type)
            .bind(key.aggregate_id.as_str())
            .bind(version_to_db(version))
            .execute(&self.pool)
            .await
            .map_err(|e| CheckpointError::DatabaseError(e.to_string()))?
            .rows_affected();

        if affected == 1 {
            return Ok(version);
        }

        let stored = self.stored_version(&key).await?;
        tracing::debug!(
            checkpoint = %key,
            requested = %version,
            stored = %stored,
            "Checkpoint update did not match"
        );
        Err(CheckpointError::Conflict {
            key,
            requested: version,
            stored,
        })
    }
}

impl CheckpointStore for PostgresCheckpointStore {
    fn get(
        &self,
        key: CheckpointKey,
    ) -> Pin<Box<dyn Future<Output = Result<Version, CheckpointError>> + Send + '_>> {
        Box::pin(async move { self.stored_version(&key).await })
    }

    fn update(
        &self,
        key: CheckpointKey,
        version: Version,
    ) -> Pin<Box<dyn Future<Output = Result<Version, CheckpointError>> + Send + '_>> {
        Box::pin(self.advance(key, version))
    }
}
