//! Recording command handlers and event dispatchers.
//!
//! - [`RecordingCommandHandler`]: records every handled command and detects
//!   overlapping execution on one aggregate
//! - [`RecordingDispatcher`]: records every dispatched event stream
//! - [`FlakyDispatcher`]: fails its first N dispatches, then delegates

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use sequent_core::{
    AggregateId, CommandHandler, CommandId, CommandMessage, DispatchError, DomainEventStream,
    EventDispatcher, HandlerError, Version,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Command handler that records what it handled.
///
/// Commands whose `command_type` is in the reject list fail with
/// [`HandlerError::Rejected`]. If two commands for the same aggregate ever run
/// at the same time, [`overlaps`](Self::overlaps) becomes non-zero.
#[derive(Clone, Debug, Default)]
pub struct RecordingCommandHandler {
    handled: Arc<Mutex<Vec<(AggregateId, CommandId)>>>,
    in_flight: Arc<Mutex<HashSet<AggregateId>>>,
    overlaps: Arc<AtomicUsize>,
    reject_types: Arc<HashSet<String>>,
    delay: Duration,
}

impl RecordingCommandHandler {
    /// Create a handler that accepts every command.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold each command for `delay` before completing it.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Reject commands of these types.
    #[must_use]
    pub fn rejecting<I, S>(mut self, command_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reject_types = Arc::new(command_types.into_iter().map(Into::into).collect());
        self
    }

    /// Every handled command, in completion order.
    #[must_use]
    pub fn handled(&self) -> Vec<(AggregateId, CommandId)> {
        self.handled.lock().unwrap().clone()
    }

    /// Handled command ids for one aggregate, in order.
    #[must_use]
    pub fn handled_for(&self, aggregate_id: &AggregateId) -> Vec<CommandId> {
        self.handled
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == aggregate_id)
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// How many times a command started while another one for the same
    /// aggregate was still running.
    #[must_use]
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

impl CommandHandler for RecordingCommandHandler {
    fn handle<'a>(
        &'a self,
        aggregate_id: &'a AggregateId,
        command: &'a CommandMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            if !self.in_flight.lock().unwrap().insert(aggregate_id.clone()) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            } else {
                tokio::task::yield_now().await;
            }
            self.handled
                .lock()
                .unwrap()
                .push((aggregate_id.clone(), command.id.clone()));
            self.in_flight.lock().unwrap().remove(aggregate_id);

            if self.reject_types.contains(&command.command_type) {
                Err(HandlerError::Rejected(format!(
                    "{} is not allowed",
                    command.command_type
                )))
            } else {
                Ok(())
            }
        })
    }
}

/// Event dispatcher that records every dispatched record.
#[derive(Clone, Debug, Default)]
pub struct RecordingDispatcher {
    dispatched: Arc<Mutex<Vec<DomainEventStream>>>,
    delay: Duration,
}

impl RecordingDispatcher {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold each dispatch for `delay`.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every dispatched record, in dispatch order.
    #[must_use]
    pub fn dispatched(&self) -> Vec<DomainEventStream> {
        self.dispatched.lock().unwrap().clone()
    }

    /// Dispatched versions for one aggregate, in dispatch order.
    #[must_use]
    pub fn versions_for(&self, aggregate_id: &AggregateId) -> Vec<Version> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .filter(|stream| &stream.aggregate_id == aggregate_id)
            .map(|stream| stream.version)
            .collect()
    }

    /// Dispatched versions grouped by aggregate.
    #[must_use]
    pub fn versions_by_aggregate(&self) -> HashMap<AggregateId, Vec<Version>> {
        let mut grouped: HashMap<AggregateId, Vec<Version>> = HashMap::new();
        for stream in self.dispatched.lock().unwrap().iter() {
            grouped
                .entry(stream.aggregate_id.clone())
                .or_default()
                .push(stream.version);
        }
        grouped
    }

    /// Number of dispatched records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }

    /// Whether nothing has been dispatched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventDispatcher for RecordingDispatcher {
    fn dispatch<'a>(
        &'a self,
        stream: &'a DomainEventStream,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.dispatched.lock().unwrap().push(stream.clone());
            Ok(())
        })
    }
}

/// Dispatcher that fails its first `failures` calls with
/// [`DispatchError::Unavailable`], then delegates to a [`RecordingDispatcher`].
#[derive(Clone, Debug)]
pub struct FlakyDispatcher {
    inner: RecordingDispatcher,
    remaining: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl FlakyDispatcher {
    /// Fail the first `failures` dispatches.
    #[must_use]
    pub fn new(failures: usize) -> Self {
        Self {
            inner: RecordingDispatcher::new(),
            remaining: Arc::new(AtomicUsize::new(failures)),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The recorder receiving successful dispatches.
    #[must_use]
    pub const fn recorder(&self) -> &RecordingDispatcher {
        &self.inner
    }

    /// Total dispatch attempts, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl EventDispatcher for FlakyDispatcher {
    fn dispatch<'a>(
        &'a self,
        stream: &'a DomainEventStream,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Box::pin(async {
                Err(DispatchError::Unavailable("injected dispatch failure".to_string()))
            });
        }
        self.inner.dispatch(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(version: u64) -> DomainEventStream {
        DomainEventStream::new(
            AggregateId::new("A"),
            "Account",
            CommandId::new(format!("c{version}")),
            Version::new(version),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn flaky_dispatcher_fails_then_records() {
        let dispatcher = FlakyDispatcher::new(2);
        let record = stream(1);

        assert!(dispatcher.dispatch(&record).await.is_err());
        assert!(dispatcher.dispatch(&record).await.is_err());
        assert!(dispatcher.dispatch(&record).await.is_ok());

        assert_eq!(dispatcher.attempts(), 3);
        assert_eq!(
            dispatcher.recorder().versions_for(&AggregateId::new("A")),
            vec![Version::new(1)]
        );
    }

    #[tokio::test]
    async fn recording_handler_rejects_configured_types() {
        let handler = RecordingCommandHandler::new().rejecting(["Overdraw"]);
        let id = AggregateId::new("A");
        let ok = CommandMessage::new(CommandId::new("c1"), id.clone(), "Deposit", Vec::new());
        let bad = CommandMessage::new(CommandId::new("c2"), id.clone(), "Overdraw", Vec::new());

        assert!(handler.handle(&id, &ok).await.is_ok());
        assert!(matches!(
            handler.handle(&id, &bad).await,
            Err(HandlerError::Rejected(_))
        ));
        assert_eq!(
            handler.handled_for(&id),
            vec![CommandId::new("c1"), CommandId::new("c2")]
        );
        assert_eq!(handler.overlaps(), 0);
    }
}
