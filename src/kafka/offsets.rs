//! Offset bookkeeping for the consumer engine.
//!
//! Messages are handled concurrently and finish in any order, but a partition
//! offset can only be committed once every message before it is done. The
//! tracker records which offsets are still in flight per partition and yields
//! the next commit point when the low-water mark moves.

use crate::{Error, Result};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Where consumed positions are recorded.
pub trait OffsetStore: Send + Sync {
    /// Marks every message before `next_offset` on the partition as consumed.
    fn store(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()>;
}

#[derive(Debug)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    highest_done: Option<i64>,
    committed: i64,
}

impl PartitionOffsets {
    fn starting_at(offset: i64) -> Self {
        Self {
            in_flight: BTreeSet::new(),
            highest_done: None,
            committed: offset,
        }
    }

    fn commit_point(&self) -> Option<i64> {
        match self.in_flight.first() {
            Some(&lowest) => Some(lowest),
            None => self.highest_done.map(|done| done + 1),
        }
    }
}

/// In-flight offsets per `(topic, partition)`.
///
/// Offsets must be begun in the order they were received. An offset that is
/// begun but never completed holds its partition's commit point back.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_insert_with(|| PartitionOffsets::starting_at(offset))
            .in_flight
            .insert(offset);
    }

    /// Marks `offset` done and returns the new commit point if it advanced.
    pub fn complete(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let state = self.partitions.get_mut(&(topic.to_string(), partition))?;
        if !state.in_flight.remove(&offset) {
            return None;
        }
        state.highest_done = Some(state.highest_done.map_or(offset, |done| done.max(offset)));

        let next = state.commit_point()?;
        if next > state.committed {
            state.committed = next;
            Some(next)
        } else {
            None
        }
    }

    pub fn in_flight(&self) -> usize {
        self.partitions
            .values()
            .map(|state| state.in_flight.len())
            .sum()
    }
}

/// Stores offsets in the consumer's local offset store; the auto-commit timer
/// sends them to the group coordinator.
pub struct KafkaOffsetStore {
    consumer: Arc<StreamConsumer>,
}

impl KafkaOffsetStore {
    pub fn new(consumer: Arc<StreamConsumer>) -> Self {
        Self { consumer }
    }
}

impl OffsetStore for KafkaOffsetStore {
    fn store(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(topic, partition, Offset::Offset(next_offset))?;
        self.consumer
            .store_offsets(&list)
            .map_err(|e| Error::Consume(format!("failed to store offset for {}[{}]: {}", topic, partition, e)))
    }
}
