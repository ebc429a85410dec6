//! Outbound contracts: the command handler and the event dispatcher.
//!
//! The engine never inspects what these do. It only needs a success/failure
//! answer: a failed command is reported to its submitter, a failed dispatch is
//! retried until it succeeds.

use crate::aggregate::AggregateId;
use crate::command::CommandMessage;
use crate::event::DomainEventStream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Failure reported by a [`CommandHandler`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The command was understood but rejected by the domain.
    #[error("Command rejected: {0}")]
    Rejected(String),

    /// No handler is registered for the command type.
    #[error("No handler for command type: {0}")]
    NoHandler(String),

    /// An infrastructure failure while handling the command.
    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Failure reported by an [`EventDispatcher`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The downstream consumer is unavailable.
    #[error("Dispatch target unavailable: {0}")]
    Unavailable(String),

    /// The downstream consumer failed while applying the events.
    #[error("Dispatch failed: {0}")]
    Failed(String),
}

/// Executes one command against its aggregate.
pub trait CommandHandler: Send + Sync {
    /// Handle `command` for `aggregate_id`.
    ///
    /// The engine guarantees at most one concurrent call per aggregate, in
    /// submission order.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] if the command could not be handled. The error
    /// is delivered to the command's submitter; the mailbox moves on.
    fn handle<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        command: &'a CommandMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;
}

/// Delivers one event stream record downstream.
pub trait EventDispatcher: Send + Sync {
    /// Dispatch the record's events, in order.
    ///
    /// The engine calls this with strictly increasing, gap-free versions per
    /// aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`]; the event mailbox retries according to its
    /// retry policy.
    fn dispatch<'a>(
        &'a self,
        stream: &'a DomainEventStream,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>>;
}
