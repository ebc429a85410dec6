//! # Sequent Core
//!
//! Core types and contracts for the Sequent per-aggregate ordering engine.
//!
//! This crate has no runtime behaviour. It defines:
//!
//! - **Identity and versioning**: [`AggregateId`], [`CommandId`], [`Version`]
//! - **Messages**: [`CommandMessage`], [`DomainEventStream`], [`SerializedEvent`]
//! - **Storage contracts**: [`EventLog`] (append-only, optimistic concurrency,
//!   command idempotency) and [`CheckpointStore`] (per-consumer dispatch
//!   checkpoints)
//! - **Outbound contracts**: [`CommandHandler`] and [`EventDispatcher`]
//! - **Environment**: [`environment::Clock`]
//!
//! The runtime that drives these lives in `sequent-runtime`; in-memory
//! implementations of the storage contracts live in `sequent-testing`, and
//! durable ones in `sequent-postgres`.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Aggregate identity and version types
pub mod aggregate;

/// Command messages
pub mod command;

/// Domain events and event stream records
pub mod event;

/// Event log contract and append results
pub mod event_log;

/// Dispatch checkpoint contract
pub mod checkpoint;

/// Command handler and event dispatcher contracts
pub mod handler;

pub use aggregate::{AggregateId, CommandId, Version};
pub use checkpoint::{CheckpointError, CheckpointKey, CheckpointStore};
pub use command::CommandMessage;
pub use event::{DomainEventStream, SerializedEvent};
pub use event_log::{AppendResult, AppendStatus, EventLog, EventLogError};
pub use handler::{CommandHandler, DispatchError, EventDispatcher, HandlerError};

/// Environment module - injected time source
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use sequent_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
