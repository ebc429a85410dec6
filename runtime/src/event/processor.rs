//! Event processor: validates event stream records and routes them to their
//! aggregate's [`EventMailbox`].

use super::mailbox::{EnqueueResult, EventMailbox, EventMailboxContext, EventOutcome};
use super::refresh::RefreshTracker;
use crate::error::EngineError;
use crate::retry::RetryPolicy;
use crate::router::{MailboxRouter, RoutedMailbox};
use crate::scheduler::Scheduler;
use sequent_core::{AggregateId, CheckpointStore, DomainEventStream, EventDispatcher, Version};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Completion handle for a submitted event stream record.
#[derive(Debug)]
pub struct EventReceipt {
    result: EnqueueResult,
    rx: oneshot::Receiver<EventOutcome>,
}

impl EventReceipt {
    /// Where the record was placed on arrival.
    #[must_use]
    pub const fn result(&self) -> EnqueueResult {
        self.result
    }

    /// Wait until the record is dispatched and checkpointed, or found to be
    /// already covered by the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Canceled`] if the mailbox went away first.
    pub async fn outcome(self) -> Result<EventOutcome, EngineError> {
        self.rx.await.map_err(|_| EngineError::Canceled)
    }
}

/// Routes event stream records to per-aggregate [`EventMailbox`]es and owns the
/// version refresh set.
pub struct EventProcessor {
    context: Arc<EventMailboxContext>,
    router: MailboxRouter<EventMailbox>,
    refresh: Arc<RefreshTracker>,
}

impl EventProcessor {
    /// Create a processor named `processor_name`.
    #[must_use]
    pub fn new(
        processor_name: impl Into<String>,
        dispatcher: Arc<dyn EventDispatcher>,
        checkpoints: Arc<dyn CheckpointStore>,
        scheduler: Arc<dyn Scheduler>,
        retry_policy: RetryPolicy,
    ) -> Self {
        let context = Arc::new(EventMailboxContext {
            processor_name: processor_name.into(),
            dispatcher,
            checkpoints,
            scheduler: Arc::clone(&scheduler),
            retry_policy,
        });
        let refresh = Arc::new(RefreshTracker::new(scheduler));

        let factory_context = Arc::clone(&context);
        let weak_refresh = Arc::downgrade(&refresh);
        let router = MailboxRouter::new("event", move |aggregate_id: &AggregateId| {
            Arc::new(EventMailbox::new(
                aggregate_id.clone(),
                Arc::clone(&factory_context),
                weak_refresh.clone(),
            ))
        });

        Self {
            context,
            router,
            refresh,
        }
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

    /// Consumer name used for checkpoints.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.context.processor_name
    }

    /// Enqueue `stream` on its aggregate's mailbox.
    ///
    /// The first record for an aggregate reads its checkpoint before it is
    /// enqueued, so the result depends only on the stored version and on the
    /// records already submitted.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidAggregateId`] for a blank aggregate id and
    /// [`EngineError::InvalidVersion`] for version 0; neither is enqueued.
    pub async fn process(&self, stream: DomainEventStream) -> Result<EventReceipt, EngineError> {
        if stream.aggregate_id.is_empty() {
            tracing::warn!(
                command_id = %stream.command_id,
                aggregate_type = %stream.aggregate_type,
                "Rejected event stream with empty aggregate id"
            );
            return Err(EngineError::InvalidAggregateId {
                message: format!("event stream from command {}", stream.command_id),
            });
        }
        if stream.version.is_initial() {
            return Err(EngineError::InvalidVersion {
                aggregate_id: stream.aggregate_id.clone(),
            });
        }

        let aggregate_id = stream.aggregate_id.clone();
        let stream = Arc::new(stream);
        let (tx, rx) = oneshot::channel();

        let lease = self.router.lease(&aggregate_id).await;
        let mailbox = lease.mailbox();
        if mailbox.next_expected_version().is_none() {
            mailbox.initialize(&stream.aggregate_type).await;
        }
        let result = mailbox.enqueue(stream, tx);
        drop(lease);

        Ok(EventReceipt { result, rx })
    }

    /// Remove idle event mailboxes with nothing pending or waiting. Returns
    /// how many were removed.
    pub fn clean_inactive(&self, inactive_timeout: Duration) -> usize {
        self.router.sweep(inactive_timeout)
    }

    /// Run one pass of the version refresh sweep.
    pub fn process_refresh(&self) {
        self.refresh.process();
    }

    /// Records buffered ahead of a gap for `aggregate_id`.
    #[must_use]
    pub fn waiting_count(&self, aggregate_id: &AggregateId) -> usize {
        self.router
            .get(aggregate_id)
            .map_or(0, |mailbox| mailbox.waiting_count())
    }

    /// Records queued for dispatch for `aggregate_id`.
    #[must_use]
    pub fn pending_count(&self, aggregate_id: &AggregateId) -> usize {
        self.router
            .get(aggregate_id)
            .map_or(0, |mailbox| mailbox.pending_count())
    }

    /// Next version the mailbox for `aggregate_id` will dispatch, if known.
    #[must_use]
    pub fn next_expected_version(&self, aggregate_id: &AggregateId) -> Option<Version> {
        self.router
            .get(aggregate_id)
            .and_then(|mailbox| mailbox.next_expected_version())
    }

    /// Number of live event mailboxes.
    #[must_use]
    pub fn mailbox_count(&self) -> usize {
        self.router.len()
    }

    /// Number of mailboxes in the version refresh set.
    #[must_use]
    pub fn refreshing_count(&self) -> usize {
        self.refresh.len()
    }
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("name", &self.context.processor_name)
            .field("router", &self.router)
            .field("refresh", &self.refresh)
            .finish()
    }
}
