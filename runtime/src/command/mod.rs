//! Command side: one ordered mailbox per aggregate.

mod mailbox;
mod processor;

pub use mailbox::{CommandMailbox, ProcessingCommand};
pub use processor::{CommandProcessor, CommandReceipt};
