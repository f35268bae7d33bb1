use super::{OutboxRecord, OutboxStore};
use crate::message::{Envelope, Message};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Process-local outbox. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryOutbox {
    records: Mutex<Vec<OutboxRecord>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<T: Message>(&self, topic: &str, envelope: &Envelope<T>) -> Result<OutboxRecord> {
        let record = OutboxRecord::from_envelope(topic, envelope)?;
        self.insert(record.clone());
        Ok(record)
    }

    pub fn insert(&self, record: OutboxRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn list_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let mut pending = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        // Stable sort keeps insertion order for equal timestamps.
        pending.sort_by_key(|record| record.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn delete_by_ids(&self, ids: &[Uuid]) -> Result<u64> {
        let ids: HashSet<&Uuid> = ids.iter().collect();
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|record| !ids.contains(&record.id));
        Ok((before - records.len()) as u64)
    }
}
