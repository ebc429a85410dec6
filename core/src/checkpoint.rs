//! Dispatch checkpoints: the last event version each consumer has dispatched,
//! per aggregate.
//!
//! A checkpoint lets an event processor resume exactly where it left off after
//! a restart. Checkpoints only ever advance by one:
//!
//! - `update(key, 1)` inserts the record.
//! - `update(key, n)` for `n > 1` is a conditional update matching
//!   `version == n - 1`. A mismatch is reported as
//!   [`CheckpointError::Conflict`] and is reconciled by the caller, never
//!   retried blindly.
//!
//! A missing record reads as [`Version::INITIAL`].

use crate::aggregate::{AggregateId, Version};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Identity of one checkpoint record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointKey {
    /// Name of the consumer (event processor) owning the checkpoint.
    pub processor: String,

    /// Aggregate type name.
    pub aggregate_type: String,

    /// Aggregate id.
    pub aggregate_id: AggregateId,
}

impl CheckpointKey {
    /// Create a new key.
    #[must_use]
    pub fn new(
        processor: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
    ) -> Self {
        Self {
            processor: processor.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id,
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}#{}",
            self.processor, self.aggregate_type, self.aggregate_id
        )
    }
}

/// Errors from checkpoint store operations.
#[derive(Error, Debug, Clone)]
pub enum CheckpointError {
    /// The conditional update did not match: the stored version is not
    /// `requested - 1`.
    #[error("Checkpoint conflict for {key}: requested {requested}, stored {stored}")]
    Conflict {
        /// The checkpoint that was being updated.
        key: CheckpointKey,
        /// The version the caller tried to write.
        requested: Version,
        /// The version currently stored (0 if absent).
        stored: Version,
    },

    /// Database connection or query error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// General I/O error.
    #[error("I/O error: {0}")]
    IoError(String),
}

impl CheckpointError {
    /// Whether retrying the same call may succeed.
    ///
    /// Conflicts are never transient: the same write will keep failing until
    /// the caller learns the authoritative version.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseError(_) | Self::IoError(_))
    }

    /// Whether this is a conditional-update conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Storage contract for dispatch checkpoints.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the trait can be shared as
/// `Arc<dyn CheckpointStore>`.
pub trait CheckpointStore: Send + Sync {
    /// Read the last dispatched version, `Version::INITIAL` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] on backend failure.
    fn get(
        &self,
        key: CheckpointKey,
    ) -> Pin<Box<dyn Future<Output = Result<Version, CheckpointError>> + Send + '_>>;

    /// Advance the checkpoint to `version` and return it.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::Conflict`] if the stored version is not `version - 1`
    ///   (or, for `version == 1`, if a record already exists)
    /// - [`CheckpointError::DatabaseError`] on backend failure
    fn update(
        &self,
        key: CheckpointKey,
        version: Version,
    ) -> Pin<Box<dyn Future<Output = Result<Version, CheckpointError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_joins_parts() {
        let key = CheckpointKey::new("P", "T", AggregateId::new("A"));
        assert_eq!(key.to_string(), "P#T#A");
    }

    #[test]
    fn conflict_is_not_transient() {
        let error = CheckpointError::Conflict {
            key: CheckpointKey::new("P", "T", AggregateId::new("A")),
            requested: Version::new(3),
            stored: Version::new(1),
        };
        assert!(error.is_conflict());
        assert!(!error.is_transient());
        let display = error.to_string();
        assert!(display.contains("requested 3"));
        assert!(display.contains("stored 1"));
    }
}
