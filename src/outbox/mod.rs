//! Transactional outbox.
//!
//! Producers that must not lose a message when the broker is unreachable
//! write an [`OutboxRecord`] in the same database transaction as their
//! business change. An [`OutboxDispatcher`] later publishes pending records
//! oldest-first and deletes them once the whole batch was acknowledged.
//!
//! Records are write-once, delete-once. Delivery is at-least-once: a batch
//! that fails half-way is published again in full on the next poll.
//!
//! Backends:
//!
//! - [`PostgresOutbox`]: `tokio-postgres` table, inserts through the caller's
//!   transaction
//! - [`InMemoryOutbox`]: process-local, for tests and local runs

pub mod dispatcher;
pub mod memory;
pub mod postgres;

pub use dispatcher::OutboxDispatcher;
pub use memory::InMemoryOutbox;
pub use postgres::PostgresOutbox;

use crate::kafka::headers::MessageHeaders;
use crate::kafka::serializer::JsonSerializer;
use crate::message::{Envelope, Message};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A persisted, not yet published envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    /// Envelope id; primary key and delete key.
    pub id: Uuid,
    /// Destination topic, resolved at write time.
    pub topic: String,
    pub message_type: String,
    pub trace_context: Option<String>,
    /// Serialized envelope.
    pub message: String,
    /// Envelope occurrence time, stamped as `message.event_occurred`.
    pub occurred_at: DateTime<Utc>,
    /// Row write time; drives dispatch order.
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    pub fn from_envelope<T: Message>(topic: impl Into<String>, envelope: &Envelope<T>) -> Result<Self> {
        Ok(Self {
            id: envelope.id,
            topic: topic.into(),
            message_type: T::TYPE_NAME.to_string(),
            trace_context: envelope.trace_context.clone(),
            message: JsonSerializer::serialize(envelope)?,
            occurred_at: envelope.occurred_at,
            created_at: Utc::now(),
        })
    }

    /// Identity headers stamped when the record is published.
    pub fn headers(&self) -> MessageHeaders {
        MessageHeaders::identity(
            self.id,
            &self.message_type,
            self.trace_context.as_deref(),
            self.occurred_at,
        )
    }
}

/// Read side of the outbox used by the dispatcher.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` records, oldest `created_at` first.
    async fn list_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>>;

    /// Removes the given records; unknown ids are ignored.
    async fn delete_by_ids(&self, ids: &[Uuid]) -> Result<u64>;
}
