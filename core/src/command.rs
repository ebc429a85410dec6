//! Command messages addressed to a single aggregate.

use crate::aggregate::{AggregateId, CommandId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A command targeting one aggregate instance.
///
/// The payload is opaque to the engine: it is handed to the
/// [`CommandHandler`](crate::handler::CommandHandler) unchanged. Idempotency of
/// command ids is the handler's concern; the engine only guarantees per-aggregate
/// ordering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Unique command id.
    pub id: CommandId,

    /// The aggregate this command is routed to.
    pub aggregate_id: AggregateId,

    /// Command type identifier (e.g., "Deposit.v1").
    pub command_type: String,

    /// Serialized command payload.
    pub payload: Vec<u8>,

    /// When the command was created.
    pub timestamp: DateTime<Utc>,
}

impl CommandMessage {
    /// Create a command stamped with the current time.
    #[must_use]
    pub fn new(
        id: CommandId,
        aggregate_id: AggregateId,
        command_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id,
            aggregate_id,
            command_type: command_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for CommandMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandMessage {{ id: {}, type: {}, aggregate: {} }}",
            self.id, self.command_type, self.aggregate_id
        )
    }
}
