//! # Sequent Runtime
//!
//! Per-aggregate ordered mailbox engine.
//!
//! Commands and event stream records are routed to one mailbox per aggregate.
//! Work for one aggregate runs strictly in order; work for different
//! aggregates runs in parallel on a bounded worker pool.
//!
//! ## Core Components
//!
//! - **Router** ([`router`]): owns the aggregate → mailbox map, leases and
//!   sweeps mailboxes
//! - **Command mailbox** ([`command`]): runs commands one at a time per aggregate
//! - **Event mailbox** ([`event`]): resequences out-of-order event streams,
//!   dispatches them, and advances the dispatch checkpoint
//! - **Retry helper** ([`retry`]): the single place I/O failures are retried
//! - **Engine** ([`Engine`]): wires the processors to a worker pool and runs
//!   the periodic sweeps
//!
//! ## Example
//!
//! ```ignore
//! use sequent_runtime::{Engine, EngineConfig};
//!
//! let engine = Engine::new(EngineConfig::default(), handler, dispatcher, checkpoints)?;
//! engine.start();
//!
//! let receipt = engine.submit_event_stream(stream).await?;
//! assert_eq!(receipt.result(), EnqueueResult::Accepted);
//! receipt.outcome().await?;
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

/// Worker pool and periodic tasks
pub mod scheduler;

/// Mailbox routing, leasing and sweeping
pub mod router;

/// Command mailboxes
pub mod command;

/// Event mailboxes and version refresh
pub mod event;

/// Appending event streams and publishing them
pub mod commit;

/// Engine configuration
pub mod config;

/// Engine errors
pub mod error;

mod engine;

pub use command::{CommandProcessor, CommandReceipt};
pub use commit::{CommitOutcome, EventCommitter};
pub use config::{ConfigError, EngineConfig};
pub use engine::Engine;
pub use error::EngineError;
pub use event::{EnqueueResult, EventOutcome, EventProcessor, EventReceipt};
pub use retry::{RetryBudget, RetryPolicy};
