//! Command processor: validates commands and routes them to their mailbox.

use super::mailbox::{CommandMailbox, ProcessingCommand};
use crate::error::EngineError;
use crate::router::{MailboxRouter, RoutedMailbox};
use crate::scheduler::Scheduler;
use sequent_core::{AggregateId, CommandHandler, CommandId, CommandMessage, HandlerError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Completion handle for a submitted command.
#[derive(Debug)]
pub struct CommandReceipt {
    command_id: CommandId,
    rx: oneshot::Receiver<Result<(), HandlerError>>,
}

impl CommandReceipt {
    /// Id of the submitted command.
    #[must_use]
    pub const fn command_id(&self) -> &CommandId {
        &self.command_id
    }

    /// Wait for the handler's outcome.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Handler`] if the handler failed or rejected the command
    /// - [`EngineError::Canceled`] if the mailbox went away without answering
    pub async fn outcome(self) -> Result<(), EngineError> {
        match self.rx.await {
            Ok(result) => result.map_err(EngineError::from),
            Err(_) => Err(EngineError::Canceled),
        }
    }
}

/// Routes commands to per-aggregate [`CommandMailbox`]es.
pub struct CommandProcessor {
    router: MailboxRouter<CommandMailbox>,
}

impl CommandProcessor {
    /// Create a processor whose mailboxes call `handler` on `scheduler`.
    #[must_use]
    pub fn new(
        handler: Arc<dyn CommandHandler>,
        scheduler: Arc<dyn Scheduler>,
        batch_size: usize,
    ) -> Self {
        let router = MailboxRouter::new("command", move |aggregate_id: &AggregateId| {
            Arc::new(CommandMailbox::new(
                aggregate_id.clone(),
                Arc::clone(&handler),
                Arc::clone(&scheduler),
                batch_size,
            ))
        });
        Self { router }
    }

    /// Set lease spin parameters.
    #[must_use]
    pub fn with_lease_settings(mut self, retry_delay: Duration, warn_threshold: u64) -> Self {
        self.router = self
            .router
            .with_lease_retry_delay(retry_delay)
            .with_lease_warn_threshold(warn_threshold);
        self
    }

    /// Enqueue `command` on its aggregate's mailbox.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidAggregateId`] if the command has a blank
    /// aggregate id; such commands are never enqueued.
    pub async fn process(&self, command: CommandMessage) -> Result<CommandReceipt, EngineError> {
        if command.aggregate_id.is_empty() {
            tracing::warn!(command_id = %command.id, "Rejected command with empty aggregate id");
            return Err(EngineError::InvalidAggregateId {
                message: format!("command {}", command.id),
            });
        }

        let command_id = command.id.clone();
        let aggregate_id = command.aggregate_id.clone();
        let (processing, rx) = ProcessingCommand::new(command);

        let lease = self.router.lease(&aggregate_id).await;
        lease.mailbox().enqueue(processing);
        drop(lease);

        Ok(CommandReceipt { command_id, rx })
    }

    /// Remove idle, empty command mailboxes. Returns how many were removed.
    pub fn clean_inactive(&self, inactive_timeout: Duration) -> usize {
        self.router.sweep(inactive_timeout)
    }

    /// Number of live command mailboxes.
    #[must_use]
    pub fn mailbox_count(&self) -> usize {
        self.router.len()
    }

    /// Commands queued but not yet started for `aggregate_id`.
    #[must_use]
    pub fn pending_count(&self, aggregate_id: &AggregateId) -> usize {
        self.router
            .get(aggregate_id)
            .map_or(0, |mailbox| mailbox.pending_count())
    }
}

impl std::fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("router", &self.router)
            .finish()
    }
}
