//! # Sequent Testing
//!
//! Testing utilities for the Sequent engine.
//!
//! This crate provides:
//! - [`InMemoryEventLog`]: reference implementation of the event log contract
//! - [`InMemoryCheckpointStore`]: reference implementation of the checkpoint
//!   contract, plus [`FailingCheckpointStore`] for retry paths
//! - Recording command handlers and event dispatchers
//! - A deterministic [`FixedClock`]
//!
//! ## Example
//!
//! ```ignore
//! use sequent_testing::{InMemoryCheckpointStore, RecordingCommandHandler, RecordingDispatcher};
//! use sequent_runtime::{Engine, EngineConfig};
//!
//! #[tokio::test]
//! async fn events_dispatch_in_order() {
//!     let dispatcher = RecordingDispatcher::new();
//!     let engine = Engine::new(
//!         EngineConfig::default(),
//!         Arc::new(RecordingCommandHandler::new()),
//!         Arc::new(dispatcher.clone()),
//!         Arc::new(InMemoryCheckpointStore::new()),
//!     )?;
//!     // ...
//! }
//! ```

use chrono::{DateTime, Utc};
use sequent_core::environment::Clock;

mod checkpoint_mocks;
mod event_log_mocks;
mod handler_mocks;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    pub use crate::checkpoint_mocks::{FailingCheckpointStore, InMemoryCheckpointStore};
    pub use crate::event_log_mocks::InMemoryEventLog;
    pub use crate::handler_mocks::{FlakyDispatcher, RecordingCommandHandler, RecordingDispatcher};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use sequent_testing::mocks::FixedClock;
    /// use sequent_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Fixed clock at 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }
}

pub use mocks::{
    FailingCheckpointStore, FixedClock, FlakyDispatcher, InMemoryCheckpointStore,
    InMemoryEventLog, RecordingCommandHandler, RecordingDispatcher, test_clock,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }
}
