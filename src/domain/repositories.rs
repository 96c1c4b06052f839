use async_trait::async_trait;

use super::{entities::*, errors::LogError, value_objects::*};

/// The durable, partitioned log the queue bridge is written against.
///
/// Stands in for a message broker: records are appended per topic, read back
/// by offset in pages, and consumer groups keep committed positions.
#[async_trait]
pub trait DurableLog: Send + Sync {
    async fn create_topic(&self, topic: &TopicName, partitions: u32) -> Result<(), LogError>;

    async fn partitions(&self, topic: &TopicName) -> Result<Vec<TopicPartition>, LogError>;

    /// Append and return the stored record with its assigned offset.
    async fn append(&self, record: ProducerRecord) -> Result<QueueRecord, LogError>;

    /// Up to `max` records of `partition` starting at `from`. Empty once caught up.
    async fn read_from(
        &self,
        partition: &TopicPartition,
        from: Offset,
        max: usize,
    ) -> Result<Vec<QueueRecord>, LogError>;

    /// Offsets of the first record and the next record to be appended.
    async fn offset_range(&self, partition: &TopicPartition) -> Result<(Offset, Offset), LogError>;

    /// Store `offset` as the next position `group` reads from.
    async fn commit(
        &self,
        group: &GroupId,
        partition: &TopicPartition,
        offset: Offset,
    ) -> Result<(), LogError>;

    async fn committed(
        &self,
        group: &GroupId,
        partition: &TopicPartition,
    ) -> Result<Option<Offset>, LogError>;

    /// Register `member` and return the partitions of `topics` it now owns.
    async fn join_group(
        &self,
        group: &GroupId,
        member: &str,
        topics: &[TopicName],
    ) -> Result<Vec<TopicPartition>, LogError>;

    async fn leave_group(&self, group: &GroupId, member: &str) -> Result<(), LogError>;
}
