//! Task scheduling: the bounded worker pool that runs mailbox drains, and the
//! named periodic tasks that run the engine's sweeps.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// A unit of work handed to a [`Scheduler`].
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs drain tasks. Mailboxes only ever talk to this trait, never to tokio
/// directly.
pub trait Scheduler: Send + Sync {
    /// Schedule `task` for execution. Never blocks the caller.
    fn schedule(&self, task: Task);
}

/// Tokio-backed worker pool bounded by a semaphore.
///
/// At most `size` tasks run concurrently; the rest wait for a permit without
/// occupying a runtime thread.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool allowing `size` concurrent tasks (at least one).
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Configured concurrency.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Number of idle slots right now.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Scheduler for WorkerPool {
    fn schedule(&self, task: Task) {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            // The semaphore is never closed.
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        });
    }
}

/// Whole milliseconds in `period`, saturating at `u64::MAX`.
fn period_millis(period: Duration) -> u64 {
    u64::try_from(period.as_millis()).unwrap_or(u64::MAX)
}

/// Named background tasks run on a fixed period.
///
/// Starting a task under a name that is already running replaces it.
/// All tasks are aborted when the registry is dropped.
#[derive(Debug, Default)]
pub struct PeriodicTasks {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PeriodicTasks {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` every `period`, first after one full period.
    pub fn start_task<F, Fut>(&self, name: impl Into<String>, period: Duration, mut action: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracing::trace!(task = %task_name, "Running periodic task");
                action().await;
            }
        });

        let previous = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.clone(), handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        tracing::debug!(task = %name, period_ms = period_millis(period), "Periodic task started");
    }

    /// Stop the task registered as `name`. Returns whether one was running.
    pub fn stop_task(&self, name: &str) -> bool {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name);
        match removed {
            Some(handle) => {
                handle.abort();
                tracing::debug!(task = %name, "Periodic task stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every task.
    pub fn stop_all(&self) {
        let drained: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain()
            .collect();
        for (name, handle) in drained {
            handle.abort();
            tracing::debug!(task = %name, "Periodic task stopped");
        }
    }

    /// Whether a task named `name` is registered.
    #[must_use]
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(name)
    }
}

impl Drop for PeriodicTasks {
    fn drop(&mut self) {
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_pool_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            pool.schedule(Box::pin(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        for _ in 0..200 {
            if done.load(Ordering::SeqCst) == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn period_millis_saturates() {
        assert_eq!(period_millis(Duration::from_micros(1_500_900)), 1_500);
        assert_eq!(period_millis(Duration::from_secs(u64::MAX)), u64::MAX);
    }

    #[test]
    fn worker_pool_size_is_at_least_one() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_runs_until_stopped() {
        let tasks = PeriodicTasks::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);

        tasks.start_task("tick", Duration::from_millis(100), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(tasks.is_running("tick"));

        tokio::time::sleep(Duration::from_millis(350)).await;
        let seen = ticks.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        assert!(tasks.stop_task("tick"));
        assert!(!tasks.stop_task("tick"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
