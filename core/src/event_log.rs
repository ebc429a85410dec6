//! Append-only event log contract with optimistic concurrency.
//!
//! The event log stores [`DomainEventStream`] records per aggregate. Appends are
//! validated per aggregate, independently of the other aggregates in the same
//! batch, so a batch may partially succeed.
//!
//! # Validation order (per aggregate sub-batch)
//!
//! 1. The first record's version must be `current + 1`, else **duplicate event**
//!    (version conflict).
//! 2. Consecutive records must increase by exactly one, else **duplicate event**.
//! 3. No record's command id may already be recorded for the aggregate, else
//!    **duplicate command**. The whole sub-batch is rejected.
//!
//! Only after all three checks pass are the records written and the aggregate's
//! current version advanced.
//!
//! Neither rejection is an `Err`: both are reported through [`AppendResult`] so
//! callers can tell "someone else already advanced this aggregate" from "this
//! exact submission was replayed". `Err` is reserved for I/O failures that left
//! nothing written. When a backend fails after some aggregates were already
//! decided, it returns `Ok` and lists the failed and untried aggregates in
//! [`AppendResult::failed`] instead, so earlier outcomes are not lost.
//!
//! # Implementations
//!
//! - `InMemoryEventLog` (in `sequent-testing`): reference implementation
//! - `PostgresEventLog` (in `sequent-postgres`): durable implementation

use crate::aggregate::{AggregateId, CommandId, Version};
use crate::event::DomainEventStream;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur while talking to an event log backend.
#[derive(Error, Debug, Clone)]
pub enum EventLogError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// General I/O error.
    #[error("I/O error: {0}")]
    IoError(String),
}

impl EventLogError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseError(_) | Self::IoError(_))
    }
}

/// Per-aggregate outcome of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    /// Records were written and the aggregate's version advanced.
    Success,
    /// Version conflict: the aggregate was already advanced, or the sub-batch
    /// was not contiguous.
    DuplicateEvent,
    /// One or more command ids were already recorded for the aggregate.
    DuplicateCommand,
    /// The backend failed before this aggregate's sub-batch was decided.
    /// Nothing was written for it; appending it again is safe.
    Failed,
}

/// Result of a batch append, reported per aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendResult {
    /// Aggregates whose sub-batch was written.
    pub succeeded: Vec<AggregateId>,

    /// Aggregates rejected as version conflicts.
    pub duplicate_events: Vec<AggregateId>,

    /// Aggregates rejected for replayed command ids, with the offending ids.
    pub duplicate_commands: HashMap<AggregateId, Vec<CommandId>>,

    /// Aggregates left undecided by a backend failure.
    pub failed: Vec<AggregateId>,
}

impl AppendResult {
    /// Create an empty result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful aggregate.
    pub fn add_success(&mut self, aggregate_id: AggregateId) {
        if !self.succeeded.contains(&aggregate_id) {
            self.succeeded.push(aggregate_id);
        }
    }

    /// Record a version conflict.
    pub fn add_duplicate_event(&mut self, aggregate_id: AggregateId) {
        if !self.duplicate_events.contains(&aggregate_id) {
            self.duplicate_events.push(aggregate_id);
        }
    }

    /// Record replayed command ids for an aggregate.
    pub fn add_duplicate_commands(&mut self, aggregate_id: AggregateId, command_ids: Vec<CommandId>) {
        self.duplicate_commands
            .entry(aggregate_id)
            .or_default()
            .extend(command_ids);
    }

    /// Record an aggregate left undecided by a backend failure.
    pub fn add_failed(&mut self, aggregate_id: AggregateId) {
        if !self.failed.contains(&aggregate_id) {
            self.failed.push(aggregate_id);
        }
    }

    /// Whether no aggregate has been decided yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty()
            && self.duplicate_events.is_empty()
            && self.duplicate_commands.is_empty()
            && self.failed.is_empty()
    }

    /// Outcome for one aggregate, or `None` if it was not part of the batch.
    #[must_use]
    pub fn status_of(&self, aggregate_id: &AggregateId) -> Option<AppendStatus> {
        if self.succeeded.contains(aggregate_id) {
            Some(AppendStatus::Success)
        } else if self.duplicate_events.contains(aggregate_id) {
            Some(AppendStatus::DuplicateEvent)
        } else if self.duplicate_commands.contains_key(aggregate_id) {
            Some(AppendStatus::DuplicateCommand)
        } else if self.failed.contains(aggregate_id) {
            Some(AppendStatus::Failed)
        } else {
            None
        }
    }

    /// Whether every aggregate in the batch succeeded.
    #[must_use]
    pub fn is_all_success(&self) -> bool {
        self.duplicate_events.is_empty()
            && self.duplicate_commands.is_empty()
            && self.failed.is_empty()
    }
}

/// Append-only, per-aggregate-versioned event storage.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the engine shares them behind `Arc`.
/// Every operation must be safe to retry.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the trait can be used as
/// `Arc<dyn EventLog>`.
pub trait EventLog: Send + Sync {
    /// Append a batch of records, grouped and validated per aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError`] only for backend failures. Version conflicts and
    /// duplicate commands are reported in the [`AppendResult`].
    fn batch_append(
        &self,
        streams: Vec<DomainEventStream>,
    ) -> Pin<Box<dyn Future<Output = Result<AppendResult, EventLogError>> + Send + '_>>;

    /// Append a single record.
    ///
    /// # Errors
    ///
    /// Same as [`EventLog::batch_append`].
    fn append(
        &self,
        stream: DomainEventStream,
    ) -> Pin<Box<dyn Future<Output = Result<AppendResult, EventLogError>> + Send + '_>> {
        self.batch_append(vec![stream])
    }

    /// Load an aggregate's records with versions in `[min_version, max_version]`,
    /// clamped to `[1, current version]`, in increasing version order.
    ///
    /// An unknown aggregate yields an empty vector.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError`] on backend failure.
    fn query(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: String,
        min_version: Version,
        max_version: Version,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DomainEventStream>, EventLogError>> + Send + '_>>;

    /// Find the record stored at `version`.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError`] on backend failure.
    fn find_by_version(
        &self,
        aggregate_id: AggregateId,
        version: Version,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DomainEventStream>, EventLogError>> + Send + '_>>;

    /// Find the record produced by `command_id`.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError`] on backend failure.
    fn find_by_command(
        &self,
        aggregate_id: AggregateId,
        command_id: CommandId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DomainEventStream>, EventLogError>> + Send + '_>>;
}
