//! `PostgreSQL` event log.

use crate::{version_from_db, version_to_db};
use chrono::{DateTime, Utc};
use sequent_core::{
    AggregateId, AppendResult, CommandId, DomainEventStream, EventLog, EventLogError,
    SerializedEvent, Version,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

const COMMAND_UNIQUE: &str = "event_streams_command_unique";

const SELECT_COLUMNS: &str =
    "SELECT aggregate_id, aggregate_type, version, command_id, events, created_at FROM event_streams";

/// Outcome of appending one aggregate's sub-batch.
enum SubBatch {
    Written,
    VersionConflict,
    DuplicateCommands(Vec<CommandId>),
}

/// Event log backed by the `event_streams` table.
///
/// Appends for one aggregate run in a transaction holding a transaction-scoped
/// advisory lock on the aggregate id, so concurrent writers to the same
/// aggregate are serialized while other aggregates proceed in parallel. The
/// primary key and the command unique constraint still back the checks if a
/// writer bypasses the lock.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE event_streams (
///     aggregate_id   TEXT        NOT NULL,
///     aggregate_type TEXT        NOT NULL,
///     version        BIGINT      NOT NULL,
///     command_id     TEXT        NOT NULL,
///     events         JSONB       NOT NULL,
///     created_at     TIMESTAMPTZ NOT NULL,
///     PRIMARY KEY (aggregate_id, version),
///     UNIQUE (aggregate_id, command_id)
/// );
/// ```
#[derive(Clone)]
pub struct PostgresEventLog {
    pool: PgPool,
}

impl PostgresEventLog {
    /// Connect to `database_url` with a pool of up to 10 connections.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::DatabaseError`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, EventLogError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| EventLogError::DatabaseError(format!("Failed to connect: {e}")))?;
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

    async fn append_aggregate(
        &self,
        aggregate_id: &AggregateId,
        streams: &[DomainEventStream],
    ) -> Result<SubBatch, EventLogError> {
        let mut tx = self.pool.begin().await.map_err(database_error)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(aggregate_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(database_error)?;

        let (current,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) FROM event_streams WHERE aggregate_id = $1",
        )
        .bind(aggregate_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(database_error)?;
        let current = version_from_db(current);

        let contiguous = streams
            .iter()
            .zip(std::iter::successors(Some(current.next()), |v| Some(v.next())))
            .all(|(stream, expected)| stream.version == expected);
        if !contiguous {
            return Ok(SubBatch::VersionConflict);
        }

        let duplicates = duplicate_commands(&mut tx, aggregate_id, streams).await?;
        if !duplicates.is_empty() {
            return Ok(SubBatch::DuplicateCommands(duplicates));
        }

        for stream in streams {
            let inserted = sqlx::query(
                r"
                INSERT INTO event_streams (
                    aggregate_id, aggregate_type, version, command_id, events, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(stream.aggregate_id.as_str())
            .bind(&stream.aggregate_type)
            .bind(version_to_db(stream.version))
            .bind(stream.command_id.as_str())
            .bind(Json(&stream.events))
            .bind(stream.timestamp)
            .execute(&mut *tx)
            .await;

            if let Err(error) = inserted {
                return match unique_violation(&error) {
                    Some(COMMAND_UNIQUE) => Ok(SubBatch::DuplicateCommands(vec![
                        stream.command_id.clone(),
                    ])),
                    Some(_) => Ok(SubBatch::VersionConflict),
                    None => Err(database_error(error)),
                };
            }
        }

        tx.commit().await.map_err(database_error)?;
        Ok(SubBatch::Written)
    }

    async fn fetch_optional(
        &self,
        filter: &str,
        aggregate_id: AggregateId,
        value: Binding,
    ) -> Result<Option<DomainEventStream>, EventLogError> {
        let sql = format!("{SELECT_COLUMNS} WHERE aggregate_id = $1 AND {filter}");
        let query = sqlx::query(&sql).bind(aggregate_id.into_inner());
        let query = match value {
            Binding::Version(version) => query.bind(version),
            Binding::Command(command) => query.bind(command),
        };
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(database_error)?;
        row.as_ref().map(stream_from_row).transpose()
    }
}

enum Binding {
    Version(i64),
    Command(String),
}

async fn duplicate_commands(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_id: &AggregateId,
    streams: &[DomainEventStream],
) -> Result<Vec<CommandId>, EventLogError> {
    let command_ids: Vec<String> = streams
        .iter()
        .map(|stream| stream.command_id.as_str().to_string())
        .collect();

    let stored: Vec<(String,)> = sqlx::query_as(
        "SELECT command_id FROM event_streams WHERE aggregate_id = $1 AND command_id = ANY($2)",
    )
    .bind(aggregate_id.as_str())
    .bind(&command_ids)
    .fetch_all(&mut **tx)
    .await
    .map_err(database_error)?;

    let mut duplicates: Vec<CommandId> = stored
        .into_iter()
        .map(|(id,)| CommandId::new(id))
        .collect();

    let mut seen = HashSet::new();
    for id in &command_ids {
        if !seen.insert(id.as_str()) {
            let id = CommandId::new(id.clone());
            if !duplicates.contains(&id) {
                duplicates.push(id);
            }
        }
    }
    Ok(duplicates)
}

fn unique_violation(error: &sqlx::Error) -> Option<&str> {
    match error {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Some(db.constraint().unwrap_or_default())
        }
        _ => None,
    }
}

#[allow(clippy::needless_pass_by_value)] // used as a map_err function
fn database_error(error: sqlx::Error) -> EventLogError {
    EventLogError::DatabaseError(error.to_string())
}

fn stream_from_row(row: &PgRow) -> Result<DomainEventStream, EventLogError> {
    let decode = |e: sqlx::Error| EventLogError::SerializationError(e.to_string());

    let aggregate_id: String = row.try_get("aggregate_id").map_err(decode)?;
    let aggregate_type: String = row.try_get("aggregate_type").map_err(decode)?;
    let version: i64 = row.try_get("version").map_err(decode)?;
    let command_id: String = row.try_get("command_id").map_err(decode)?;
    let Json(events): Json<Vec<SerializedEvent>> = row.try_get("events").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;

    Ok(DomainEventStream::new(
        AggregateId::new(aggregate_id),
        aggregate_type,
        CommandId::new(command_id),
        version_from_db(version),
        events,
    )
    .with_timestamp(created_at))
}

/// Group records by aggregate in first-seen order, dropping exact repeats.
fn group_by_aggregate(streams: Vec<DomainEventStream>) -> Vec<(AggregateId, Vec<DomainEventStream>)> {
    let mut groups: Vec<(AggregateId, Vec<DomainEventStream>)> = Vec::new();
    for stream in streams {
        let position = groups.iter().position(|(id, _)| *id == stream.aggregate_id);
        let group = match position {
            Some(index) => &mut groups[index].1,
            None => {
                groups.push((stream.aggregate_id.clone(), Vec::new()));
                let last = groups.len() - 1;
                &mut groups[last].1
            }
        };
        if !group.contains(&stream) {
            group.push(stream);
        }
    }
    groups
}

fn record_outcome(
    result: &mut AppendResult,
    aggregate_id: AggregateId,
    records: usize,
    outcome: SubBatch,
) {
    match outcome {
        SubBatch::Written => {
            tracing::debug!(aggregate_id = %aggregate_id, records, "Event streams appended");
            result.add_success(aggregate_id);
        }
        SubBatch::VersionConflict => {
            tracing::debug!(aggregate_id = %aggregate_id, "Append rejected: version conflict");
            result.add_duplicate_event(aggregate_id);
        }
        SubBatch::DuplicateCommands(command_ids) => {
            tracing::debug!(
                aggregate_id = %aggregate_id,
                duplicates = command_ids.len(),
                "Append rejected: duplicate command"
            );
            result.add_duplicate_commands(aggregate_id, command_ids);
        }
    }
}

/// Each aggregate commits in its own transaction, so a failure part way
/// through must not hide the aggregates already written. With nothing decided
/// the error is returned as is; otherwise the undecided aggregates are listed
/// as failed.
fn settle_failure(
    mut result: AppendResult,
    undecided: Vec<AggregateId>,
    error: EventLogError,
) -> Result<AppendResult, EventLogError> {
    if result.is_empty() {
        return Err(error);
    }
    tracing::warn!(
        error = %error,
        decided = result.succeeded.len() + result.duplicate_events.len() + result.duplicate_commands.len(),
        undecided = undecided.len(),
        "Batch append failed part way, reporting undecided aggregates as failed"
    );
    for aggregate_id in undecided {
        result.add_failed(aggregate_id);
    }
    Ok(result)
}

impl EventLog for PostgresEventLog {
    fn batch_append(
        &self,
        streams: Vec<DomainEventStream>,
    ) -> Pin<Box<dyn Future<Output = Result<AppendResult, EventLogError>> + Send + '_>> {
        Box::pin(async move {
            let mut result = AppendResult::new();
            let mut groups = group_by_aggregate(streams).into_iter();
            while let Some((aggregate_id, group)) = groups.next() {
                match self.append_aggregate(&aggregate_id, &group).await {
                    Ok(outcome) => record_outcome(&mut result, aggregate_id, group.len(), outcome),
                    Err(error) => {
                        let undecided = std::iter::once(aggregate_id)
                            .chain(groups.by_ref().map(|(id, _)| id))
                            .collect();
                        return settle_failure(result, undecided, error);
                    }
                }
            }
            Ok(result)
        })
    }

    fn query(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: String,
        min_version: Version,
        max_version: Version,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DomainEventStream>, EventLogError>> + Send + '_>>
    {
        Box::pin(async move {
            let sql = format!(
                "{SELECT_COLUMNS} WHERE aggregate_id = $1 AND aggregate_type = $2 \
                 AND version BETWEEN $3 AND $4 ORDER BY version"
            );
            let rows = sqlx::query(&sql)
                .bind(aggregate_id.into_inner())
                .bind(aggregate_type)
                .bind(version_to_db(min_version).max(1))
                .bind(version_to_db(max_version))
                .fetch_all(&self.pool)
                .await
                .map_err(database_error)?;
            rows.iter().map(stream_from_row).collect()
        })
    }

    fn find_by_version(
        &self,
        aggregate_id: AggregateId,
        version: Version,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DomainEventStream>, EventLogError>> + Send + '_>>
    {
        Box::pin(async move {
            self.fetch_optional(
                "version = $2",
                aggregate_id,
                Binding::Version(version_to_db(version)),
            )
            .await
        })
    }

    fn find_by_command(
        &self,
        aggregate_id: AggregateId,
        command_id: CommandId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DomainEventStream>, EventLogError>> + Send + '_>>
    {
        Box::pin(async move {
            self.fetch_optional(
                "command_id = $2",
                aggregate_id,
                Binding::Command(command_id.as_str().to_string()),
            )
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use sequent_core::AppendStatus;

    fn stream(aggregate: &str, version: u64, command: &str) -> DomainEventStream {
        DomainEventStream::new(
            AggregateId::new(aggregate),
            "Account",
            CommandId::new(command),
            Version::new(version),
            Vec::new(),
        )
    }

    #[test]
    fn grouping_keeps_first_seen_order_and_drops_repeats() {
        let first = stream("A", 1, "a1");
        let groups = group_by_aggregate(vec![
            first.clone(),
            stream("B", 1, "b1"),
            first,
            stream("A", 2, "a2"),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, AggregateId::new("A"));
        let versions: Vec<u64> = groups[0].1.iter().map(|s| s.version.value()).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(groups[1].1.len(), 1);
    }

    #[test]
    fn failure_before_any_decision_is_an_error() {
        let settled = settle_failure(
            AppendResult::new(),
            vec![AggregateId::new("A"), AggregateId::new("B")],
            EventLogError::DatabaseError("connection reset".to_string()),
        );
        assert!(matches!(settled, Err(EventLogError::DatabaseError(_))));
    }

    #[test]
    fn failure_part_way_keeps_committed_aggregates() {
        let mut result = AppendResult::new();
        record_outcome(&mut result, AggregateId::new("A"), 2, SubBatch::Written);
        record_outcome(&mut result, AggregateId::new("B"), 1, SubBatch::VersionConflict);
        record_outcome(
            &mut result,
            AggregateId::new("C"),
            1,
            SubBatch::DuplicateCommands(vec![CommandId::new("c1")]),
        );

        let settled = settle_failure(
            result,
            vec![AggregateId::new("D"), AggregateId::new("E")],
            EventLogError::DatabaseError("connection reset".to_string()),
        )
        .unwrap();

        assert_eq!(settled.status_of(&AggregateId::new("A")), Some(AppendStatus::Success));
        assert_eq!(
            settled.status_of(&AggregateId::new("B")),
            Some(AppendStatus::DuplicateEvent)
        );
        assert_eq!(
            settled.status_of(&AggregateId::new("C")),
            Some(AppendStatus::DuplicateCommand)
        );
        assert_eq!(settled.status_of(&AggregateId::new("D")), Some(AppendStatus::Failed));
        assert_eq!(settled.status_of(&AggregateId::new("E")), Some(AppendStatus::Failed));
    }
}
