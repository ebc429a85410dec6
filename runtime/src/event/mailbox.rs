//! Per-aggregate event mailbox with out-of-order resequencing.
//!
//! State per mailbox:
//!
//! - `next_expected`: the version the mailbox will dispatch next. `None`
//!   until the checkpoint has been read once (see [`EventMailbox::initialize`]).
//! - `ready`: contiguous run `next_expected, next_expected + 1, ...` waiting
//!   for the drain.
//! - `waiting`: records that arrived ahead of a gap, keyed by version.
//!
//! A record is only completed after it has been dispatched *and* its
//! checkpoint written, so a crash between the two re-dispatches at most the
//! record that was in flight.

use super::refresh::RefreshTracker;
use crate::metrics::EventMetrics;
use crate::retry::{RetryPolicy, retry_with_context};
use crate::router::{MailboxLifecycle, RoutedMailbox};
use crate::scheduler::{Scheduler, Task};
use sequent_core::{
    AggregateId, CheckpointError, CheckpointKey, CheckpointStore, DispatchError,
    DomainEventStream, EventDispatcher, Version,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Where an enqueued record ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Version below the next expected one: already dispatched, completed
    /// immediately.
    Ignored,
    /// Version is next in line: queued for dispatch.
    Accepted,
    /// Version is ahead of a gap: buffered until its predecessors arrive.
    AddToWaitingList,
}

impl EnqueueResult {
    pub(crate) const fn label(self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::Accepted => "accepted",
            Self::AddToWaitingList => "waiting",
        }
    }
}

/// How a record was completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// This mailbox dispatched the record and wrote its checkpoint.
    Dispatched,
    /// The checkpoint already covered the record; it was not dispatched again.
    AlreadyDispatched,
}

/// Collaborators shared by every event mailbox of one processor.
pub struct EventMailboxContext {
    /// Checkpoint namespace.
    pub processor_name: String,
    /// Downstream consumer.
    pub dispatcher: Arc<dyn EventDispatcher>,
    /// Checkpoint store.
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Runs drains.
    pub scheduler: Arc<dyn Scheduler>,
    /// Retry policy for dispatch and checkpoint I/O.
    pub retry_policy: RetryPolicy,
}

impl std::fmt::Debug for EventMailboxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMailboxContext")
            .field("processor_name", &self.processor_name)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

struct PendingEvent {
    stream: Arc<DomainEventStream>,
    replies: Vec<oneshot::Sender<EventOutcome>>,
}

impl PendingEvent {
    fn new(stream: Arc<DomainEventStream>, reply: oneshot::Sender<EventOutcome>) -> Self {
        Self {
            stream,
            replies: vec![reply],
        }
    }

    fn version(&self) -> Version {
        self.stream.version
    }

    fn merge(&mut self, other: Self) {
        self.replies.extend(other.replies);
    }

    fn complete(self, outcome: EventOutcome) {
        for reply in self.replies {
            let _ = reply.send(outcome);
        }
    }
}

#[derive(Default)]
struct MailboxState {
    aggregate_type: Option<String>,
    next_expected: Option<Version>,
    ready: VecDeque<PendingEvent>,
    waiting: BTreeMap<Version, PendingEvent>,
    /// Version stuck behind a lagging checkpoint and how many drains in a row
    /// hit the same conflict.
    stall: Option<(Version, u32)>,
}

impl MailboxState {
    fn park(&mut self, pending: PendingEvent) {
        match self.waiting.get_mut(&pending.version()) {
            Some(existing) => existing.merge(pending),
            None => {
                self.waiting.insert(pending.version(), pending);
            }
        }
    }

    /// Drop waiting records below `next_expected` and move the contiguous run
    /// that follows the ready queue out of `waiting`. Returns the dropped
    /// records.
    fn promote(&mut self) -> Vec<PendingEvent> {
        let Some(next) = self.next_expected else {
            return Vec::new();
        };

        let keep = self.waiting.split_off(&next);
        let stale = std::mem::replace(&mut self.waiting, keep);

        let mut want = self
            .ready
            .back()
            .map_or(next, |back| back.version().next().max(next));
        while let Some(pending) = self.waiting.remove(&want) {
            self.ready.push_back(pending);
            want = want.next();
        }

        stale.into_values().collect()
    }
}

/// Serializes and resequences event dispatch for one aggregate.
pub struct EventMailbox {
    aggregate_id: AggregateId,
    state: Mutex<MailboxState>,
    lifecycle: MailboxLifecycle,
    context: Arc<EventMailboxContext>,
    refresh: Weak<RefreshTracker>,
}

enum DrainError {
    Dispatch(DispatchError),
    Checkpoint(CheckpointError),
}

impl std::fmt::Display for DrainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dispatch(e) => e.fmt(f),
            Self::Checkpoint(e) => e.fmt(f),
        }
    }
}

impl EventMailbox {
    /// Create an empty mailbox. `refresh` is notified whenever the mailbox
    /// buffers a record it cannot dispatch yet.
    #[must_use]
    pub fn new(
        aggregate_id: AggregateId,
        context: Arc<EventMailboxContext>,
        refresh: Weak<RefreshTracker>,
    ) -> Self {
        Self {
            aggregate_id,
            state: Mutex::new(MailboxState::default()),
            lifecycle: MailboxLifecycle::new(),
            context,
            refresh,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MailboxState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Version the mailbox will dispatch next, if known.
    #[must_use]
    pub fn next_expected_version(&self) -> Option<Version> {
        self.state().next_expected
    }

    /// Aggregate type learned from the first enqueued record.
    #[must_use]
    pub fn aggregate_type(&self) -> Option<String> {
        self.state().aggregate_type.clone()
    }

    /// Consecutive checkpoint conflicts for the record currently stuck behind
    /// a lagging checkpoint, 0 when nothing is stuck.
    #[must_use]
    pub fn stalled_conflicts(&self) -> u32 {
        self.state().stall.map_or(0, |(_, repeats)| repeats)
    }

    /// Read the checkpoint for an aggregate of `aggregate_type` if the next
    /// expected version is still unknown.
    ///
    /// Called under the lease before the first enqueue so that a record at the
    /// next expected version is `Accepted` straight away. If the read fails
    /// the version stays unknown and arriving records wait for the refresh.
    pub async fn initialize(self: &Arc<Self>, aggregate_type: &str) {
        {
            let mut state = self.state();
            if state.next_expected.is_some() {
                return;
            }
            if state.aggregate_type.is_none() {
                state.aggregate_type = Some(aggregate_type.to_string());
            }
        }
        self.refresh_next_expected().await;
    }

    /// Enqueue `stream`; `reply` receives the outcome once it is completed.
    ///
    /// The caller must hold the mailbox lease.
    pub fn enqueue(
        self: &Arc<Self>,
        stream: Arc<DomainEventStream>,
        reply: oneshot::Sender<EventOutcome>,
    ) -> EnqueueResult {
        let version = stream.version;
        let pending = PendingEvent::new(stream, reply);

        let (result, next_expected) = {
            let mut state = self.state();
            if state.aggregate_type.is_none() {
                state.aggregate_type = Some(pending.stream.aggregate_type.clone());
            }

            let result = match state.next_expected {
                Some(next) if version < next => {
                    pending.complete(EventOutcome::AlreadyDispatched);
                    EnqueueResult::Ignored
                }
                Some(next) => {
                    // `ready` is a (possibly empty) stale prefix followed by the
                    // contiguous run starting at `next`.
                    match state.ready.iter_mut().find(|queued| queued.version() == version) {
                        Some(queued) => {
                            queued.merge(pending);
                            EnqueueResult::Accepted
                        }
                        None if version == next => {
                            state.ready.push_back(pending);
                            EnqueueResult::Accepted
                        }
                        None => {
                            state.park(pending);
                            EnqueueResult::AddToWaitingList
                        }
                    }
                }
                None => {
                    state.park(pending);
                    EnqueueResult::AddToWaitingList
                }
            };
            (result, state.next_expected)
        };

        EventMetrics::record_enqueued(result.label());
        tracing::debug!(
            aggregate_id = %self.aggregate_id,
            version = %version,
            next_expected = ?next_expected.map(Version::value),
            result = result.label(),
            "Event stream enqueued"
        );

        match result {
            EnqueueResult::Accepted => self.try_run(),
            EnqueueResult::AddToWaitingList => self.request_refresh(),
            EnqueueResult::Ignored => {}
        }
        result
    }

    /// Raise the next expected version to `version` (never lowers it), drop
    /// buffered records it makes stale, and promote the contiguous run.
    pub fn set_next_expected_version(self: &Arc<Self>, version: Version) {
        let (stale, runnable, previous) = {
            let mut state = self.state();
            let previous = state.next_expected;
            if previous.is_none_or(|next| version > next) {
                state.next_expected = Some(version);
            }
            let stale = state.promote();
            (stale, !state.ready.is_empty(), previous)
        };

        if previous != Some(version) {
            tracing::debug!(
                aggregate_id = %self.aggregate_id,
                previous = ?previous.map(Version::value),
                requested = %version,
                "Next expected version refreshed"
            );
        }
        for pending in stale {
            pending.complete(EventOutcome::AlreadyDispatched);
        }
        if runnable {
            self.try_run();
        }
    }

    /// Schedule a drain unless one is already running.
    pub fn try_run(self: &Arc<Self>) {
        if self.lifecycle.try_start_running() {
            self.context.scheduler.schedule(Arc::clone(self).run());
        }
    }

    fn request_refresh(self: &Arc<Self>) {
        if let Some(tracker) = self.refresh.upgrade() {
            tracker.register(self);
        }
    }

    /// Re-read the checkpoint and resynchronize `next_expected` from it.
    pub async fn refresh_next_expected(self: &Arc<Self>) {
        let Some(aggregate_type) = self.aggregate_type() else {
            return;
        };
        let key = CheckpointKey::new(
            self.context.processor_name.clone(),
            aggregate_type,
            self.aggregate_id.clone(),
        );

        let published = retry_with_context(
            "read_checkpoint",
            &self.context.retry_policy,
            || self.context.checkpoints.get(key.clone()),
            CheckpointError::is_transient,
            || format!("checkpoint {key}"),
        )
        .await;

        match published {
            Ok(version) => self.set_next_expected_version(version.next()),
            Err(error) => tracing::error!(
                aggregate_id = %self.aggregate_id,
                processor = %self.context.processor_name,
                error = %error,
                "Failed to read checkpoint during refresh"
            ),
        }
    }

    /// Front of the ready queue, completing stale records on the way.
    fn next_runnable(&self) -> Option<Arc<DomainEventStream>> {
        let mut stale = Vec::new();
        let front = {
            let mut state = self.state();
            loop {
                match (state.ready.front(), state.next_expected) {
                    (Some(front), Some(next)) if front.version() < next => {
                        if let Some(pending) = state.ready.pop_front() {
                            stale.push(pending);
                        }
                    }
                    (Some(front), _) => break Some(Arc::clone(&front.stream)),
                    (None, _) => break None,
                }
            }
        };
        for pending in stale {
            pending.complete(EventOutcome::AlreadyDispatched);
        }
        front
    }

    /// Pop the record with `version`, advance `next_expected` to at least
    /// `next`, and promote waiting records.
    fn finish(&self, version: Version, outcome: EventOutcome, next: Version) {
        let (done, stale) = {
            let mut state = self.state();
            let done = if state.ready.front().is_some_and(|front| front.version() == version) {
                state.ready.pop_front()
            } else {
                None
            };
            if state.next_expected.is_none_or(|current| next > current) {
                state.next_expected = Some(next);
            }
            if state.stall.is_some_and(|(stalled, _)| stalled <= version) {
                state.stall = None;
            }
            let stale = state.promote();
            (done, stale)
        };

        if let Some(pending) = done {
            pending.complete(outcome);
        }
        for pending in stale {
            pending.complete(EventOutcome::AlreadyDispatched);
        }
    }

    /// Count another conflict for `version`. Returns the streak length.
    fn record_stall(&self, version: Version) -> u32 {
        let mut state = self.state();
        let repeats = match state.stall {
            Some((stalled, repeats)) if stalled == version => repeats + 1,
            _ => 1,
        };
        state.stall = Some((version, repeats));
        repeats
    }

    /// Move everything in the ready queue back to `waiting`.
    fn park_ready(&self) {
        let mut state = self.state();
        while let Some(pending) = state.ready.pop_front() {
            state.park(pending);
        }
    }

    fn has_ready(&self) -> bool {
        !self.state().ready.is_empty()
    }

    fn run(self: Arc<Self>) -> Task {
        Box::pin(async move {
            while let Some(stream) = self.next_runnable() {
                let version = stream.version;
                let started = Instant::now();

                match self.dispatch_and_checkpoint(&stream).await {
                    Ok(()) => {
                        EventMetrics::record_dispatched(started.elapsed());
                        tracing::debug!(
                            aggregate_id = %self.aggregate_id,
                            aggregate_type = %stream.aggregate_type,
                            command_id = %stream.command_id,
                            version = %version,
                            "Event stream dispatched"
                        );
                        self.finish(version, EventOutcome::Dispatched, version.next());
                    }
                    Err(DrainError::Checkpoint(CheckpointError::Conflict { stored, .. }))
                        if stored >= version =>
                    {
                        tracing::info!(
                            aggregate_id = %self.aggregate_id,
                            version = %version,
                            stored = %stored,
                            "Checkpoint already covers event stream"
                        );
                        self.finish(version, EventOutcome::AlreadyDispatched, stored.next());
                    }
                    Err(DrainError::Checkpoint(CheckpointError::Conflict { stored, .. })) => {
                        let repeats = self.record_stall(version);
                        EventMetrics::record_checkpoint_stall();
                        tracing::warn!(
                            aggregate_id = %self.aggregate_id,
                            aggregate_type = %stream.aggregate_type,
                            version = %version,
                            stored = %stored,
                            repeats,
                            "Checkpoint lags the record being completed, parking until refresh"
                        );
                        self.park_ready();
                        self.request_refresh();
                        break;
                    }
                    Err(error) => {
                        tracing::error!(
                            aggregate_id = %self.aggregate_id,
                            aggregate_type = %stream.aggregate_type,
                            version = %version,
                            error = %error,
                            "Event stream could not be completed, parking until refresh"
                        );
                        self.park_ready();
                        self.request_refresh();
                        break;
                    }
                }
            }

            self.lifecycle.touch();
            self.lifecycle.stop_running();
            if self.has_ready() {
                self.try_run();
            }
        })
    }

    async fn dispatch_and_checkpoint(&self, stream: &DomainEventStream) -> Result<(), DrainError> {
        let context = &self.context;

        retry_with_context(
            "dispatch_event_stream",
            &context.retry_policy,
            || context.dispatcher.dispatch(stream),
            |_: &DispatchError| true,
            || format!("{} v{} ({})", stream.aggregate_id, stream.version, stream.command_id),
        )
        .await
        .map_err(DrainError::Dispatch)?;

        let key = CheckpointKey::new(
            context.processor_name.clone(),
            stream.aggregate_type.clone(),
            stream.aggregate_id.clone(),
        );
        retry_with_context(
            "update_checkpoint",
            &context.retry_policy,
            || context.checkpoints.update(key.clone(), stream.version),
            CheckpointError::is_transient,
            || format!("checkpoint {key} -> {}", stream.version),
        )
        .await
        .map_err(DrainError::Checkpoint)?;

        Ok(())
    }
}

impl RoutedMailbox for EventMailbox {
    fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    fn lifecycle(&self) -> &MailboxLifecycle {
        &self.lifecycle
    }

    fn pending_count(&self) -> usize {
        self.state().ready.len()
    }

    fn waiting_count(&self) -> usize {
        self.state().waiting.len()
    }
}

impl std::fmt::Debug for EventMailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("EventMailbox")
            .field("aggregate_id", &self.aggregate_id)
            .field("next_expected", &state.next_expected)
            .field("ready", &state.ready.len())
            .field("waiting", &state.waiting.len())
            .finish_non_exhaustive()
    }
}
