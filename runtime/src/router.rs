//! Mailbox router: owns the aggregate-id → mailbox map for one mailbox kind.
//!
//! The router is the only place mailboxes are created or removed:
//!
//! - [`MailboxRouter::route`] looks a mailbox up, creating it through the
//!   router's factory if absent (atomic per id).
//! - [`MailboxRouter::lease`] routes and then acquires the mailbox's lease,
//!   spinning with a short sleep. A mailbox tombstoned between lookup and lease
//!   is released and the caller transparently re-routes to a fresh one.
//! - [`MailboxRouter::sweep`] removes mailboxes that are idle, not running and
//!   empty. The emptiness check and the tombstone happen under the mailbox's
//!   lease, so an enqueuer can never add work to a mailbox that is being removed.

use crate::metrics::MailboxMetrics;
use sequent_core::AggregateId;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Lease, running and tombstone flags shared by every mailbox kind.
///
/// The lease and the running flag are independent: a leased mailbox is not
/// necessarily draining, and a draining mailbox need not be leased.
#[derive(Debug)]
pub struct MailboxLifecycle {
    leased: AtomicBool,
    running: AtomicBool,
    removed: AtomicBool,
    last_active: Mutex<Instant>,
}

impl Default for MailboxLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl MailboxLifecycle {
    /// Fresh, unleased, idle lifecycle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            leased: AtomicBool::new(false),
            running: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
        }
    }

    /// Try to take the lease. Returns `false` if someone else holds it.
    pub fn try_lease(&self) -> bool {
        self.leased
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give the lease back.
    pub fn release(&self) {
        self.leased.store(false, Ordering::Release);
    }

    /// Whether the lease is currently held.
    #[must_use]
    pub fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    /// Set the running flag. Returns `false` if a drain is already active.
    pub fn try_start_running(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear the running flag.
    pub fn stop_running(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Whether a drain is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Record activity now.
    pub fn touch(&self) {
        *self
            .last_active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
    }

    /// Whether the mailbox has been idle for at least `timeout`.
    #[must_use]
    pub fn is_inactive(&self, timeout: Duration) -> bool {
        self.last_active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .elapsed()
            >= timeout
    }

    /// Tombstone the mailbox. It is never reused afterwards.
    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// Whether the mailbox has been tombstoned.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

/// A mailbox the router can own, lease and sweep.
pub trait RoutedMailbox: Send + Sync + 'static {
    /// Aggregate this mailbox serves.
    fn aggregate_id(&self) -> &AggregateId;

    /// Shared lifecycle flags.
    fn lifecycle(&self) -> &MailboxLifecycle;

    /// Messages queued for the next drain.
    fn pending_count(&self) -> usize;

    /// Out-of-order messages buffered until their predecessors arrive.
    fn waiting_count(&self) -> usize {
        0
    }

    /// Whether the sweep may remove this mailbox.
    fn is_removable(&self, inactive_timeout: Duration) -> bool {
        let lifecycle = self.lifecycle();
        lifecycle.is_inactive(inactive_timeout)
            && !lifecycle.is_running()
            && self.pending_count() == 0
            && self.waiting_count() == 0
    }
}

/// Exclusive lease on a mailbox, released on drop.
#[derive(Debug)]
pub struct MailboxLease<M: RoutedMailbox> {
    mailbox: Arc<M>,
}

impl<M: RoutedMailbox> MailboxLease<M> {
    /// The leased mailbox.
    #[must_use]
    pub const fn mailbox(&self) -> &Arc<M> {
        &self.mailbox
    }
}

impl<M: RoutedMailbox> Deref for MailboxLease<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.mailbox
    }
}

impl<M: RoutedMailbox> Drop for MailboxLease<M> {
    fn drop(&mut self) {
        self.mailbox.lifecycle().touch();
        self.mailbox.lifecycle().release();
    }
}

type MailboxFactory<M> = Box<dyn Fn(&AggregateId) -> Arc<M> + Send + Sync>;

/// Owns the mailboxes of one kind.
pub struct MailboxRouter<M: RoutedMailbox> {
    kind: &'static str,
    mailboxes: Mutex<HashMap<AggregateId, Arc<M>>>,
    factory: MailboxFactory<M>,
    lease_retry_delay: Duration,
    lease_warn_threshold: u64,
    lease_warnings: AtomicU64,
}

impl<M: RoutedMailbox> MailboxRouter<M> {
    /// Create a router for mailboxes of `kind` built by `factory`.
    pub fn new<F>(kind: &'static str, factory: F) -> Self
    where
        F: Fn(&AggregateId) -> Arc<M> + Send + Sync + 'static,
    {
        Self {
            kind,
            mailboxes: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
            lease_retry_delay: Duration::from_millis(1),
            lease_warn_threshold: 10_000,
            lease_warnings: AtomicU64::new(0),
        }
    }

    /// Set the sleep between lease attempts.
    #[must_use]
    pub const fn with_lease_retry_delay(mut self, delay: Duration) -> Self {
        self.lease_retry_delay = delay;
        self
    }

    /// Warn (and count) every `threshold` failed lease attempts.
    #[must_use]
    pub const fn with_lease_warn_threshold(mut self, threshold: u64) -> Self {
        self.lease_warn_threshold = if threshold == 0 { 1 } else { threshold };
        self
    }

    /// Mailbox kind label used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        self.kind
    }

    /// Find the mailbox for `aggregate_id`, creating it if absent.
    pub fn route(&self, aggregate_id: &AggregateId) -> Arc<M> {
        let mut mailboxes = self
            .mailboxes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(mailbox) = mailboxes.get(aggregate_id) {
            return Arc::clone(mailbox);
        }

        let mailbox = (self.factory)(aggregate_id);
        mailboxes.insert(aggregate_id.clone(), Arc::clone(&mailbox));
        let count = mailboxes.len();
        drop(mailboxes);

        MailboxMetrics::record_active(self.kind, count);
        tracing::info!(kind = self.kind, aggregate_id = %aggregate_id, "Mailbox created");
        mailbox
    }

    /// Route to the mailbox for `aggregate_id` and take its lease.
    ///
    /// Spins with `lease_retry_delay` between attempts and never gives up.
    /// Every `lease_warn_threshold` attempts a warning is logged so starvation
    /// stays visible.
    pub async fn lease(&self, aggregate_id: &AggregateId) -> MailboxLease<M> {
        let mut attempts: u64 = 0;
        loop {
            let mailbox = self.route(aggregate_id);
            if mailbox.lifecycle().try_lease() {
                if !mailbox.lifecycle().is_removed() {
                    return MailboxLease { mailbox };
                }
                // Tombstoned after we looked it up; the next route creates a fresh one.
                mailbox.lifecycle().release();
                tracing::debug!(
                    kind = self.kind,
                    aggregate_id = %aggregate_id,
                    "Leased a removed mailbox, re-routing"
                );
                continue;
            }

            attempts += 1;
            if attempts % self.lease_warn_threshold == 0 {
                self.lease_warnings.fetch_add(1, Ordering::Relaxed);
                MailboxMetrics::record_lease_retries(self.kind, self.lease_warn_threshold);
                tracing::warn!(
                    kind = self.kind,
                    aggregate_id = %aggregate_id,
                    attempts,
                    "Still waiting to lease mailbox"
                );
            }
            tokio::time::sleep(self.lease_retry_delay).await;
        }
    }

    /// Starvation warnings logged by [`MailboxRouter::lease`] so far.
    #[must_use]
    pub fn lease_warnings(&self) -> u64 {
        self.lease_warnings.load(Ordering::Relaxed)
    }

    /// Look a mailbox up without creating it.
    #[must_use]
    pub fn get(&self, aggregate_id: &AggregateId) -> Option<Arc<M>> {
        self.mailboxes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(aggregate_id)
            .cloned()
    }

    /// Number of live mailboxes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mailboxes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the router holds no mailboxes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every mailbox that is idle for `inactive_timeout`, not running,
    /// and carries no pending or waiting messages. Returns how many were removed.
    ///
    /// Mailboxes whose lease is held are skipped until the next sweep.
    pub fn sweep(&self, inactive_timeout: Duration) -> usize {
        let candidates: Vec<Arc<M>> = self
            .mailboxes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .filter(|mailbox| mailbox.is_removable(inactive_timeout))
            .cloned()
            .collect();

        let mut removed = 0;
        for mailbox in candidates {
            let lifecycle = mailbox.lifecycle();
            if !lifecycle.try_lease() {
                continue;
            }

            if mailbox.is_removable(inactive_timeout) {
                let mut mailboxes = self
                    .mailboxes
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let still_current = mailboxes
                    .get(mailbox.aggregate_id())
                    .is_some_and(|current| Arc::ptr_eq(current, &mailbox));
                if still_current {
                    mailboxes.remove(mailbox.aggregate_id());
                }
                drop(mailboxes);

                lifecycle.mark_removed();
                removed += 1;
                MailboxMetrics::record_removed(self.kind);
                tracing::info!(
                    kind = self.kind,
                    aggregate_id = %mailbox.aggregate_id(),
                    "Removed inactive mailbox"
                );
            }

            lifecycle.release();
        }

        MailboxMetrics::record_active(self.kind, self.len());
        removed
    }
}

impl<M: RoutedMailbox> std::fmt::Debug for MailboxRouter<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxRouter")
            .field("kind", &self.kind)
            .field("mailboxes", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct TestMailbox {
        aggregate_id: AggregateId,
        lifecycle: MailboxLifecycle,
        pending: AtomicUsize,
        waiting: AtomicUsize,
    }

    impl RoutedMailbox for TestMailbox {
        fn aggregate_id(&self) -> &AggregateId {
            &self.aggregate_id
        }

        fn lifecycle(&self) -> &MailboxLifecycle {
            &self.lifecycle
        }

        fn pending_count(&self) -> usize {
            self.pending.load(Ordering::SeqCst)
        }

        fn waiting_count(&self) -> usize {
            self.waiting.load(Ordering::SeqCst)
        }
    }

    fn router() -> MailboxRouter<TestMailbox> {
        MailboxRouter::new("test", |id: &AggregateId| {
            Arc::new(TestMailbox {
                aggregate_id: id.clone(),
                lifecycle: MailboxLifecycle::new(),
                pending: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
            })
        })
    }

    #[test]
    fn route_creates_once_per_id() {
        let router = router();
        let a1 = router.route(&AggregateId::new("A"));
        let a2 = router.route(&AggregateId::new("A"));
        let b = router.route(&AggregateId::new("B"));

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(router.len(), 2);
    }

    #[tokio::test]
    async fn lease_is_exclusive_and_released_on_drop() {
        let router = router();
        let id = AggregateId::new("A");

        let lease = router.lease(&id).await;
        assert!(lease.lifecycle().is_leased());
        assert!(!lease.lifecycle().try_lease());

        let mailbox = Arc::clone(lease.mailbox());
        drop(lease);
        assert!(!mailbox.lifecycle().is_leased());
    }

    #[tokio::test]
    async fn lease_waits_for_holder() {
        let router = Arc::new(router().with_lease_warn_threshold(2));
        let id = AggregateId::new("A");
        let first = router.lease(&id).await;

        let waiter = {
            let router = Arc::clone(&router);
            let id = id.clone();
            tokio::spawn(async move {
                let lease = router.lease(&id).await;
                lease.aggregate_id().clone()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(first);

        let leased = waiter.await.unwrap();
        assert_eq!(leased, id);
    }

    #[tokio::test]
    async fn starved_lease_warns_every_threshold_attempts() {
        let router = Arc::new(
            router()
                .with_lease_retry_delay(Duration::from_millis(1))
                .with_lease_warn_threshold(3),
        );
        let id = AggregateId::new("A");
        let first = router.lease(&id).await;
        assert_eq!(router.lease_warnings(), 0);

        let waiter = {
            let router = Arc::clone(&router);
            let id = id.clone();
            tokio::spawn(async move { router.lease(&id).await.aggregate_id().clone() })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while router.lease_warnings() < 2 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        drop(first);
        waiter.await.unwrap();

        let warnings = router.lease_warnings();
        assert!(warnings >= 2);

        // An uncontended lease does not warn.
        drop(router.lease(&id).await);
        assert_eq!(router.lease_warnings(), warnings);
    }

    #[tokio::test]
    async fn lease_reroutes_after_removal() {
        let router = router();
        let id = AggregateId::new("A");
        let old = router.route(&id);

        assert_eq!(router.sweep(Duration::ZERO), 1);
        assert!(old.lifecycle().is_removed());

        let lease = router.lease(&id).await;
        assert!(!Arc::ptr_eq(lease.mailbox(), &old));
        assert!(!lease.lifecycle().is_removed());
    }

    #[test]
    fn sweep_keeps_mailboxes_with_work() {
        let router = router();
        let pending = router.route(&AggregateId::new("pending"));
        pending.pending.store(1, Ordering::SeqCst);
        let waiting = router.route(&AggregateId::new("waiting"));
        waiting.waiting.store(2, Ordering::SeqCst);
        let running = router.route(&AggregateId::new("running"));
        assert!(running.lifecycle().try_start_running());
        router.route(&AggregateId::new("idle"));

        assert_eq!(router.sweep(Duration::ZERO), 1);
        assert_eq!(router.len(), 3);
        assert!(router.get(&AggregateId::new("idle")).is_none());
        assert!(!pending.lifecycle().is_removed());
        assert!(!waiting.lifecycle().is_removed());
        assert!(!running.lifecycle().is_removed());
    }

    #[test]
    fn sweep_skips_leased_and_recently_active() {
        let router = router();
        let leased = router.route(&AggregateId::new("leased"));
        assert!(leased.lifecycle().try_lease());
        router.route(&AggregateId::new("fresh"));

        assert_eq!(router.sweep(Duration::ZERO), 1);
        assert!(!leased.lifecycle().is_removed());

        assert_eq!(router.sweep(Duration::from_secs(3600)), 0);
        assert_eq!(router.len(), 1);
    }
}
