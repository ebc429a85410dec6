//! Domain events and the versioned event streams that carry them.
//!
//! A command handled against one aggregate produces one [`DomainEventStream`]:
//! the ordered list of domain events it emitted, stamped with the aggregate's
//! next version and the originating command id. Event payloads are opaque to the
//! engine; they travel as [`SerializedEvent`] bytes.
//!
//! # Example
//!
//! ```
//! use sequent_core::event::{DomainEventStream, SerializedEvent};
//! use sequent_core::aggregate::{AggregateId, CommandId, Version};
//!
//! let stream = DomainEventStream::new(
//!     AggregateId::new("account-1"),
//!     "BankAccount",
//!     CommandId::new("cmd-1"),
//!     Version::new(1),
//!     vec![SerializedEvent::new("AccountOpened.v1".to_string(), vec![1, 2, 3], None)],
//! );
//! assert_eq!(stream.version, Version::FIRST);
//! ```

use crate::aggregate::{AggregateId, CommandId, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Error types for event payload encoding.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// A domain event that can be carried inside a [`DomainEventStream`].
///
/// `event_type()` should return a stable identifier with a schema version
/// suffix, e.g. `"AccountOpened.v1"`.
pub trait Event: Send + Sync + 'static {
    /// Returns the event type identifier for this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes do not decode into
    /// this event type.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// A serialized domain event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// The event type identifier (e.g., "AccountOpened.v1").
    pub event_type: String,

    /// The serialized event data.
    pub data: Vec<u8>,

    /// Optional metadata (correlation id, causation id, user id, ...).
    pub metadata: Option<serde_json::Value>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    #[must_use]
    pub const fn new(
        event_type: String,
        data: Vec<u8>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            data,
            metadata,
        }
    }

    /// Create a serialized event from an [`Event`].
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        metadata: Option<serde_json::Value>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            data: event.to_bytes()?,
            metadata,
        })
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, size: {} bytes }}",
            self.event_type,
            self.data.len()
        )
    }
}

/// One versioned record in an aggregate's event history.
///
/// For a fixed aggregate the records form the gap-free sequence 1, 2, 3, …
/// The event log enforces this on append; the event mailbox re-establishes it
/// on delivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainEventStream {
    /// The aggregate this record belongs to.
    pub aggregate_id: AggregateId,

    /// Type name of the owning aggregate (namespace for the id).
    pub aggregate_type: String,

    /// The command whose handling produced these events.
    pub command_id: CommandId,

    /// Position of this record in the aggregate's history (1-based).
    pub version: Version,

    /// When the record was produced.
    pub timestamp: DateTime<Utc>,

    /// The domain events, in emission order.
    pub events: Vec<SerializedEvent>,
}

impl DomainEventStream {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn new(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        command_id: CommandId,
        version: Version,
        events: Vec<SerializedEvent>,
    ) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            command_id,
            version,
            timestamp: Utc::now(),
            events,
        }
    }

    /// Override the record timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl fmt::Display for DomainEventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DomainEventStream {{ aggregate: {}#{}, version: {}, command: {}, events: {} }}",
            self.aggregate_type,
            self.aggregate_id,
            self.version,
            self.command_id,
            self.events.len()
        )
    }
}
