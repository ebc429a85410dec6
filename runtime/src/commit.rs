//! Event committing: append a command's event stream to the log, then hand it
//! to the event processor for ordered dispatch.
//!
//! The append outcome decides what happens next:
//!
//! | Append status | Action |
//! |---------------|--------|
//! | `Success` | publish the record |
//! | `DuplicateEvent` | another writer advanced the aggregate; nothing is published |
//! | `DuplicateCommand` | the command was replayed; the stored record is published again |
//! | `Failed` | nothing was written; reported as an event log error |
//!
//! Republishing on a duplicate command is safe because the event mailbox
//! ignores versions it has already dispatched.

use crate::error::EngineError;
use crate::event::{EventProcessor, EventReceipt};
use crate::metrics::EventLogMetrics;
use crate::retry::{RetryPolicy, retry_with_context};
use sequent_core::{AppendStatus, DomainEventStream, EventLog, EventLogError};
use std::sync::Arc;

/// What [`EventCommitter::commit`] did with a record.
#[derive(Debug)]
pub enum CommitOutcome {
    /// Appended and enqueued for dispatch.
    Committed(EventReceipt),
    /// The command had already been committed; its stored record was enqueued
    /// again.
    Republished(EventReceipt),
    /// The aggregate was already at or beyond this version.
    VersionConflict,
}

/// Appends event streams and publishes them.
pub struct EventCommitter {
    log: Arc<dyn EventLog>,
    events: Arc<EventProcessor>,
    retry_policy: RetryPolicy,
}

impl EventCommitter {
    /// Create a committer over `log` publishing to `events`.
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>, events: Arc<EventProcessor>, retry_policy: RetryPolicy) -> Self {
        Self {
            log,
            events,
            retry_policy,
        }
    }

    /// Append `stream` and publish it according to the append status.
    ///
    /// # Errors
    ///
    /// - [`EngineError::EventLog`] if the log keeps failing past the retry budget
    /// - any error from [`EventProcessor::process`]
    pub async fn commit(&self, stream: DomainEventStream) -> Result<CommitOutcome, EngineError> {
        let aggregate_id = stream.aggregate_id.clone();
        let command_id = stream.command_id.clone();
        let version = stream.version;

        let result = retry_with_context(
            "append_event_stream",
            &self.retry_policy,
            || self.log.append(stream.clone()),
            EventLogError::is_transient,
            || format!("{aggregate_id} v{version} ({command_id})"),
        )
        .await?;

        match result.status_of(&aggregate_id) {
            Some(AppendStatus::Success) => {
                EventLogMetrics::record_append("success");
                tracing::debug!(
                    aggregate_id = %aggregate_id,
                    version = %version,
                    command_id = %command_id,
                    "Event stream appended"
                );
                Ok(CommitOutcome::Committed(self.events.process(stream).await?))
            }
            Some(AppendStatus::DuplicateEvent) => {
                EventLogMetrics::record_append("duplicate_event");
                tracing::info!(
                    aggregate_id = %aggregate_id,
                    version = %version,
                    command_id = %command_id,
                    "Version conflict on append, aggregate already advanced"
                );
                Ok(CommitOutcome::VersionConflict)
            }
            Some(AppendStatus::DuplicateCommand) => {
                EventLogMetrics::record_append("duplicate_command");
                tracing::info!(
                    aggregate_id = %aggregate_id,
                    command_id = %command_id,
                    "Command already committed, republishing stored event stream"
                );
                self.republish(stream).await
            }
            Some(AppendStatus::Failed) => {
                EventLogMetrics::record_append("failed");
                Err(EngineError::EventLog(EventLogError::IoError(format!(
                    "append for aggregate {aggregate_id} was left undecided by a backend failure"
                ))))
            }
            None => Err(EngineError::EventLog(EventLogError::IoError(format!(
                "append result did not mention aggregate {aggregate_id}"
            )))),
        }
    }

    async fn republish(&self, stream: DomainEventStream) -> Result<CommitOutcome, EngineError> {
        let stored = retry_with_context(
            "find_by_command",
            &self.retry_policy,
            || {
                self.log
                    .find_by_command(stream.aggregate_id.clone(), stream.command_id.clone())
            },
            EventLogError::is_transient,
            || format!("{} ({})", stream.aggregate_id, stream.command_id),
        )
        .await?;

        match stored {
            Some(stored) => Ok(CommitOutcome::Republished(self.events.process(stored).await?)),
            None => {
                tracing::warn!(
                    aggregate_id = %stream.aggregate_id,
                    command_id = %stream.command_id,
                    "Duplicate command reported but no stored event stream found"
                );
                Ok(CommitOutcome::VersionConflict)
            }
        }
    }
}

impl std::fmt::Debug for EventCommitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCommitter")
            .field("events", &self.events)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}
