//! Errors surfaced by the engine to submitters.

use sequent_core::{AggregateId, CheckpointError, EventLogError, HandlerError};
use thiserror::Error;

/// Errors returned by [`Engine`](crate::Engine) and the processors.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// The message carried a missing or blank aggregate id. Never enqueued.
    #[error("Invalid aggregate id for {message}: aggregate id must not be empty")]
    InvalidAggregateId {
        /// Short description of the rejected message.
        message: String,
    },

    /// An event stream record carried version 0. Versions are 1-based.
    #[error("Invalid version 0 for aggregate {aggregate_id}")]
    InvalidVersion {
        /// Aggregate the record was addressed to.
        aggregate_id: AggregateId,
    },

    /// The engine has been stopped and accepts no new work.
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// The command handler reported a failure.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// An event log operation failed after its retry budget.
    #[error(transparent)]
    EventLog(#[from] EventLogError),

    /// A checkpoint operation failed after its retry budget.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// The mailbox was dropped before delivering an outcome.
    #[error("Completion channel closed before an outcome was delivered")]
    Canceled,
}
