//! Event side: one resequencing mailbox per aggregate, plus the version
//! refresh protocol that heals a mailbox's expected version from its
//! checkpoint.

mod mailbox;
mod processor;
mod refresh;

pub use mailbox::{EnqueueResult, EventMailbox, EventMailboxContext, EventOutcome};
pub use processor::{EventProcessor, EventReceipt};
pub use refresh::RefreshTracker;
