//! Per-aggregate command mailbox.

use crate::metrics::CommandMetrics;
use crate::router::{MailboxLifecycle, RoutedMailbox};
use crate::scheduler::{Scheduler, Task};
use futures::FutureExt;
use sequent_core::{AggregateId, CommandHandler, CommandMessage, HandlerError};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// A queued command and the channel its outcome is reported on.
#[derive(Debug)]
pub struct ProcessingCommand {
    /// The command.
    pub message: CommandMessage,
    reply: oneshot::Sender<Result<(), HandlerError>>,
}

impl ProcessingCommand {
    /// Wrap `message`, returning the receiver for its outcome.
    #[must_use]
    pub fn new(message: CommandMessage) -> (Self, oneshot::Receiver<Result<(), HandlerError>>) {
        let (reply, rx) = oneshot::channel();
        (Self { message, reply }, rx)
    }

    fn complete(self, outcome: Result<(), HandlerError>) {
        // The submitter may have stopped listening.
        let _ = self.reply.send(outcome);
    }
}

/// Serializes command execution for one aggregate.
///
/// Commands run one at a time in enqueue order. The running flag guarantees at
/// most one drain task per mailbox; the drain handles up to `batch_size`
/// commands, then yields its worker and reschedules itself if work remains.
pub struct CommandMailbox {
    aggregate_id: AggregateId,
    queue: Mutex<VecDeque<ProcessingCommand>>,
    lifecycle: MailboxLifecycle,
    handler: Arc<dyn CommandHandler>,
    scheduler: Arc<dyn Scheduler>,
    batch_size: usize,
}

impl CommandMailbox {
    /// Create an empty mailbox for `aggregate_id`.
    #[must_use]
    pub fn new(
        aggregate_id: AggregateId,
        handler: Arc<dyn CommandHandler>,
        scheduler: Arc<dyn Scheduler>,
        batch_size: usize,
    ) -> Self {
        Self {
            aggregate_id,
            queue: Mutex::new(VecDeque::new()),
            lifecycle: MailboxLifecycle::new(),
            handler,
            scheduler,
            batch_size: batch_size.max(1),
        }
    }

    /// Queue `command` and schedule a drain if none is active.
    pub fn enqueue(self: &Arc<Self>, command: ProcessingCommand) {
        tracing::debug!(
            aggregate_id = %self.aggregate_id,
            command_id = %command.message.id,
            command_type = %command.message.command_type,
            "Command enqueued"
        );
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(command);
        CommandMetrics::record_enqueued();
        self.try_run();
    }

    /// Schedule a drain unless one is already running.
    pub fn try_run(self: &Arc<Self>) {
        if self.lifecycle.try_start_running() {
            self.scheduler.schedule(Arc::clone(self).run());
        }
    }

    fn pop(&self) -> Option<ProcessingCommand> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
    }

    fn run(self: Arc<Self>) -> Task {
        Box::pin(async move {
            let mut handled = 0;
            while handled < self.batch_size {
                let Some(command) = self.pop() else {
                    break;
                };
                let outcome = self.handle(&command.message).await;
                command.complete(outcome);
                handled += 1;
            }

            self.lifecycle.touch();
            self.lifecycle.stop_running();
            if self.pending_count() > 0 {
                tracing::trace!(
                    aggregate_id = %self.aggregate_id,
                    handled,
                    "Command batch finished with work remaining, rescheduling"
                );
                self.try_run();
            }
        })
    }

    async fn handle(&self, command: &CommandMessage) -> Result<(), HandlerError> {
        let outcome = AssertUnwindSafe(self.handler.handle(&self.aggregate_id, command))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HandlerError::Failed("command handler panicked".to_string())));

        match &outcome {
            Ok(()) => {
                CommandMetrics::record_handled("ok");
                tracing::debug!(
                    aggregate_id = %self.aggregate_id,
                    command_id = %command.id,
                    "Command handled"
                );
            }
            Err(HandlerError::Rejected(reason)) => {
                CommandMetrics::record_handled("rejected");
                tracing::info!(
                    aggregate_id = %self.aggregate_id,
                    command_id = %command.id,
                    reason = %reason,
                    "Command rejected"
                );
            }
            Err(error) => {
                CommandMetrics::record_handled("failed");
                tracing::error!(
                    aggregate_id = %self.aggregate_id,
                    command_id = %command.id,
                    command_type = %command.command_type,
                    error = %error,
                    "Command handler failed"
                );
            }
        }
        outcome
    }
}

impl RoutedMailbox for CommandMailbox {
    fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    fn lifecycle(&self) -> &MailboxLifecycle {
        &self.lifecycle
    }

    fn pending_count(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for CommandMailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandMailbox")
            .field("aggregate_id", &self.aggregate_id)
            .field("pending", &self.pending_count())
            .field("running", &self.lifecycle.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::WorkerPool;
    use sequent_core::CommandId;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Records the order commands were handled in and fails commands whose
    /// type is "fail".
    #[derive(Default)]
    struct OrderHandler {
        seen: Mutex<Vec<String>>,
    }

    impl CommandHandler for OrderHandler {
        fn handle<'a>(
            &'a self,
            _aggregate_id: &'a AggregateId,
            command: &'a CommandMessage,
        ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                self.seen.lock().unwrap().push(command.id.to_string());
                match command.command_type.as_str() {
                    "fail" => Err(HandlerError::Failed("boom".to_string())),
                    "panic" => std::panic::panic_any("handler blew up"),
                    _ => Ok(()),
                }
            })
        }
    }

    fn command(id: &str, command_type: &str) -> CommandMessage {
        CommandMessage::new(CommandId::new(id), AggregateId::new("A"), command_type, Vec::new())
    }

    fn mailbox(handler: Arc<OrderHandler>, batch_size: usize) -> Arc<CommandMailbox> {
        Arc::new(CommandMailbox::new(
            AggregateId::new("A"),
            handler,
            Arc::new(WorkerPool::new(4)),
            batch_size,
        ))
    }

    #[tokio::test]
    async fn commands_run_in_order_across_batches() {
        let handler = Arc::new(OrderHandler::default());
        let mailbox = mailbox(Arc::clone(&handler), 2);

        let mut receivers = Vec::new();
        for i in 0..7 {
            let (processing, rx) = ProcessingCommand::new(command(&format!("c{i}"), "ok"));
            mailbox.enqueue(processing);
            receivers.push(rx);
        }
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Ok(()));
        }

        let seen = handler.seen.lock().unwrap().clone();
        let expected: Vec<String> = (0..7).map(|i| format!("c{i}")).collect();
        assert_eq!(seen, expected);
        assert_eq!(mailbox.pending_count(), 0);
    }

    #[tokio::test]
    async fn failure_is_reported_and_next_command_still_runs() {
        let handler = Arc::new(OrderHandler::default());
        let mailbox = mailbox(Arc::clone(&handler), 1000);

        let (first, first_rx) = ProcessingCommand::new(command("c1", "fail"));
        let (second, second_rx) = ProcessingCommand::new(command("c2", "ok"));
        mailbox.enqueue(first);
        mailbox.enqueue(second);

        assert_eq!(
            first_rx.await.unwrap(),
            Err(HandlerError::Failed("boom".to_string()))
        );
        assert_eq!(second_rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn panicking_handler_does_not_wedge_mailbox() {
        let handler = Arc::new(OrderHandler::default());
        let mailbox = mailbox(Arc::clone(&handler), 1000);

        let (first, first_rx) = ProcessingCommand::new(command("c1", "panic"));
        mailbox.enqueue(first);
        assert!(matches!(first_rx.await.unwrap(), Err(HandlerError::Failed(_))));

        let (second, second_rx) = ProcessingCommand::new(command("c2", "ok"));
        mailbox.enqueue(second);
        assert_eq!(second_rx.await.unwrap(), Ok(()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!mailbox.lifecycle().is_running());
    }
}
