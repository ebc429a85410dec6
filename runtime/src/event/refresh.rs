//! Version refresh for event mailboxes holding out-of-order records.
//!
//! A mailbox that buffers a record ahead of a gap registers here. Registration
//! triggers an immediate checkpoint read; the periodic sweep
//! ([`RefreshTracker::process`]) repeats the read for every registered mailbox
//! that still has waiting records and forgets the ones that drained.
//! At most one refresh per aggregate is in flight at a time.

use super::mailbox::EventMailbox;
use crate::router::RoutedMailbox;
use crate::scheduler::Scheduler;
use sequent_core::AggregateId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Tracks mailboxes whose next expected version must be re-read from the
/// checkpoint store.
pub struct RefreshTracker {
    scheduler: Arc<dyn Scheduler>,
    to_refresh: Mutex<HashMap<AggregateId, Arc<EventMailbox>>>,
    refreshing: Arc<Mutex<HashSet<AggregateId>>>,
}

impl RefreshTracker {
    /// Create a tracker that runs refreshes on `scheduler`.
    #[must_use]
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            to_refresh: Mutex::new(HashMap::new()),
            refreshing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Add `mailbox` to the refresh set and refresh it now.
    pub fn register(&self, mailbox: &Arc<EventMailbox>) {
        let added = self
            .to_refresh
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(mailbox.aggregate_id().clone(), Arc::clone(mailbox))
            .is_none();
        if added {
            tracing::info!(
                aggregate_id = %mailbox.aggregate_id(),
                waiting = mailbox.waiting_count(),
                "Mailbox added to version refresh set"
            );
        }
        self.refresh(mailbox);
    }

    /// Schedule a checkpoint read for `mailbox` unless one is already running.
    pub fn refresh(&self, mailbox: &Arc<EventMailbox>) {
        let aggregate_id = mailbox.aggregate_id().clone();
        let started = self
            .refreshing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(aggregate_id.clone());
        if !started {
            tracing::trace!(aggregate_id = %aggregate_id, "Refresh already in flight");
            return;
        }

        let refreshing = Arc::clone(&self.refreshing);
        let mailbox = Arc::clone(mailbox);
        self.scheduler.schedule(Box::pin(async move {
            mailbox.refresh_next_expected().await;
            refreshing
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&aggregate_id);
        }));
    }

    /// Refresh every registered mailbox that still has waiting records and
    /// drop the ones that have none.
    pub fn process(&self) {
        let registered: Vec<Arc<EventMailbox>> = self
            .to_refresh
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for mailbox in registered {
            if mailbox.waiting_count() > 0 {
                self.refresh(&mailbox);
                continue;
            }

            let mut to_refresh = self
                .to_refresh
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let current = to_refresh
                .get(mailbox.aggregate_id())
                .is_some_and(|registered| Arc::ptr_eq(registered, &mailbox));
            // Re-check under the lock: a concurrent enqueue may have parked a record.
            if current && mailbox.waiting_count() == 0 {
                to_refresh.remove(mailbox.aggregate_id());
                drop(to_refresh);
                tracing::info!(
                    aggregate_id = %mailbox.aggregate_id(),
                    "Mailbox removed from version refresh set"
                );
            }
        }
    }

    /// Number of mailboxes in the refresh set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.to_refresh
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the refresh set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `aggregate_id` is registered.
    #[must_use]
    pub fn contains(&self, aggregate_id: &AggregateId) -> bool {
        self.to_refresh
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(aggregate_id)
    }
}

impl std::fmt::Debug for RefreshTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshTracker")
            .field("registered", &self.len())
            .finish_non_exhaustive()
    }
}
