//! In-memory checkpoint stores.
//!
//! - [`InMemoryCheckpointStore`]: reference implementation of the
//!   insert-or-conditional-update protocol
//! - [`FailingCheckpointStore`]: wraps any store and fails the first N calls
//!   with a transient error, to exercise retry paths

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use sequent_core::{CheckpointError, CheckpointKey, CheckpointStore, Version};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// In-memory dispatch checkpoints.
///
/// Besides the stored versions it keeps the sequence of successful updates,
/// so tests can assert that each version was checkpointed exactly once.
///
/// # Example
///
/// ```
/// use sequent_testing::InMemoryCheckpointStore;
/// use sequent_core::{AggregateId, CheckpointKey, CheckpointStore, Version};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryCheckpointStore::new();
/// let key = CheckpointKey::new("P", "T", AggregateId::new("A"));
///
/// store.update(key.clone(), Version::new(1)).await?;
/// store.update(key.clone(), Version::new(2)).await?;
/// assert!(store.update(key.clone(), Version::new(4)).await.is_err());
/// assert_eq!(store.get(key).await?, Version::new(2));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryCheckpointStore {
    versions: Arc<RwLock<HashMap<CheckpointKey, Version>>>,
    updates: Arc<Mutex<Vec<(CheckpointKey, Version)>>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a checkpoint directly, bypassing the update protocol.
    pub fn set(&self, key: CheckpointKey, version: Version) {
        self.versions.write().unwrap().insert(key, version);
    }

    /// Current stored version, without going through the async contract.
    #[must_use]
    pub fn version_of(&self, key: &CheckpointKey) -> Version {
        self.versions
            .read()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(Version::INITIAL)
    }

    /// Every successful update, in order.
    #[must_use]
    pub fn updates(&self) -> Vec<(CheckpointKey, Version)> {
        self.updates.lock().unwrap().clone()
    }

    /// Number of tracked checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.versions.read().unwrap().len()
    }

    /// Whether no checkpoints are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.read().unwrap().is_empty()
    }

    fn apply(&self, key: CheckpointKey, version: Version) -> Result<Version, CheckpointError> {
        let mut versions = self.versions.write().unwrap();
        let stored = versions.get(&key).copied();

        let accepted = if version == Version::FIRST {
            stored.is_none()
        } else {
            stored == Some(version.previous())
        };
        if !accepted {
            return Err(CheckpointError::Conflict {
                key,
                requested: version,
                stored: stored.unwrap_or(Version::INITIAL),
            });
        }

        versions.insert(key.clone(), version);
        self.updates.lock().unwrap().push((key, version));
        Ok(version)
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn get(
        &self,
        key: CheckpointKey,
    ) -> Pin<Box<dyn Future<Output = Result<Version, CheckpointError>> + Send + '_>> {
        Box::pin(async move { Ok(self.version_of(&key)) })
    }

    fn update(
        &self,
        key: CheckpointKey,
        version: Version,
    ) -> Pin<Box<dyn Future<Output = Result<Version, CheckpointError>> + Send + '_>> {
        Box::pin(async move { self.apply(key, version) })
    }
}

/// Checkpoint store wrapper that fails its first `failures` calls (reads and
/// updates alike) with [`CheckpointError::DatabaseError`].
#[derive(Debug)]
pub struct FailingCheckpointStore<S> {
    inner: S,
    remaining: AtomicUsize,
    calls: AtomicUsize,
}

impl<S: CheckpointStore> FailingCheckpointStore<S> {
    /// Wrap `inner`, failing the first `failures` calls.
    #[must_use]
    pub const fn new(inner: S, failures: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    /// Total calls seen, failed ones included.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    fn should_fail(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<S: CheckpointStore> CheckpointStore for FailingCheckpointStore<S> {
    fn get(
        &self,
        key: CheckpointKey,
    ) -> Pin<Box<dyn Future<Output = Result<Version, CheckpointError>> + Send + '_>> {
        if self.should_fail() {
            return Box::pin(async {
                Err(CheckpointError::DatabaseError("injected read failure".to_string()))
            });
        }
        self.inner.get(key)
    }

    fn update(
        &self,
        key: CheckpointKey,
        version: Version,
    ) -> Pin<Box<dyn Future<Output = Result<Version, CheckpointError>> + Send + '_>> {
        if self.should_fail() {
            return Box::pin(async {
                Err(CheckpointError::DatabaseError("injected update failure".to_string()))
            });
        }
        self.inner.update(key, version)
    }
}
