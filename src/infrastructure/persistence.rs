use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info};
use parking_lot::RwLock;
use std::sync::Arc;

use crate::domain::{
    entities::*,
    errors::LogError,
    repositories::DurableLog,
    services::PartitionRouter,
    value_objects::*,
};

/// Faults injected into an [`InMemoryLog`], for exercising failure paths
#[derive(Debug, Clone, Default)]
struct Faults {
    reject_appends: Option<String>,
    stall_appends: bool,
    fail_reads: Option<String>,
}

/// In-memory implementation of the durable log
#[derive(Clone)]
pub struct InMemoryLog {
    topics: Arc<DashMap<TopicName, Topic>>,
    offsets: Arc<DashMap<(GroupId, TopicPartition), Offset>>,
    owners: Arc<DashMap<(GroupId, TopicPartition), String>>,
    router: Arc<PartitionRouter>,
    faults: Arc<RwLock<Faults>>,
    default_partitions: u32,
    auto_create_topics: bool,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            offsets: Arc::new(DashMap::new()),
            owners: Arc::new(DashMap::new()),
            router: Arc::new(PartitionRouter::new()),
            faults: Arc::new(RwLock::new(Faults::default())),
            default_partitions: 1,
            auto_create_topics: true,
        }
    }

    /// Partition count for topics created on first use
    pub fn with_default_partitions(mut self, partitions: u32) -> Self {
        self.default_partitions = partitions.max(1);
        self
    }

    /// Whether appends and group joins create unknown topics
    pub fn with_auto_create_topics(mut self, enabled: bool) -> Self {
        self.auto_create_topics = enabled;
        self
    }

    /// Reject every append with `reason` (`None` clears the fault)
    pub fn reject_appends(&self, reason: Option<&str>) {
        self.faults.write().reject_appends = reason.map(str::to_string);
    }

    /// Make appends hang without ever acknowledging
    pub fn stall_appends(&self, stalled: bool) {
        self.faults.write().stall_appends = stalled;
    }

    /// Fail every read with `reason` (`None` clears the fault)
    pub fn fail_reads(&self, reason: Option<&str>) {
        self.faults.write().fail_reads = reason.map(str::to_string);
    }

    /// Number of records stored across all partitions of `topic`
    pub fn record_count(&self, topic: &TopicName) -> u64 {
        self.topics
            .get(topic)
            .map(|entry| entry.value().record_count)
            .unwrap_or(0)
    }

    fn ensure_topic(&self, topic: &TopicName) -> Result<(), LogError> {
        if self.topics.contains_key(topic) {
            return Ok(());
        }
        if !self.auto_create_topics {
            return Err(LogError::TopicNotFound(topic.clone()));
        }
        self.topics.entry(topic.clone()).or_insert_with(|| {
            info!(
                "Creating new topic: {} ({} partitions)",
                topic, self.default_partitions
            );
            Topic::new(topic.clone(), self.default_partitions)
        });
        Ok(())
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableLog for InMemoryLog {
    async fn create_topic(&self, topic: &TopicName, partitions: u32) -> Result<(), LogError> {
        let validated = TopicName::new(topic.0.clone())?;
        if self.topics.contains_key(&validated) {
            return Err(LogError::TopicAlreadyExists(validated));
        }
        info!("Created new topic: {} ({} partitions)", validated, partitions.max(1));
        self.topics
            .insert(validated.clone(), Topic::new(validated, partitions));
        Ok(())
    }

    async fn partitions(&self, topic: &TopicName) -> Result<Vec<TopicPartition>, LogError> {
        let entry = self
            .topics
            .get(topic)
            .ok_or_else(|| LogError::TopicNotFound(topic.clone()))?;
        Ok(entry.partitions.iter().map(|p| p.id.clone()).collect())
    }

    async fn append(&self, record: ProducerRecord) -> Result<QueueRecord, LogError> {
        let faults = self.faults.read().clone();
        if faults.stall_appends {
            debug!("Append to {} stalled", record.topic);
            std::future::pending::<()>().await;
        }
        if let Some(reason) = faults.reject_appends {
            return Err(LogError::Rejected(reason));
        }

        self.ensure_topic(&record.topic)?;
        let mut topic = self
            .topics
            .get_mut(&record.topic)
            .ok_or_else(|| LogError::TopicNotFound(record.topic.clone()))?;
        let partition = self.router.route(&record, topic.partition_count());
        let stored = topic.append(partition, record)?;

        debug!(
            "Record stored at offset {} in {}",
            stored.offset,
            stored.topic_partition()
        );
        Ok(stored)
    }

    async fn read_from(
        &self,
        partition: &TopicPartition,
        from: Offset,
        max: usize,
    ) -> Result<Vec<QueueRecord>, LogError> {
        if let Some(reason) = self.faults.read().fail_reads.clone() {
            return Err(LogError::Unavailable(reason));
        }
        let topic = self
            .topics
            .get(&partition.topic)
            .ok_or_else(|| LogError::TopicNotFound(partition.topic.clone()))?;
        let stored = topic
            .get_partition(partition.partition)
            .ok_or_else(|| LogError::PartitionNotFound(partition.clone()))?;
        Ok(stored.read_from(from, max))
    }

    async fn offset_range(&self, partition: &TopicPartition) -> Result<(Offset, Offset), LogError> {
        let topic = self
            .topics
            .get(&partition.topic)
            .ok_or_else(|| LogError::TopicNotFound(partition.topic.clone()))?;
        let stored = topic
            .get_partition(partition.partition)
            .ok_or_else(|| LogError::PartitionNotFound(partition.clone()))?;
        Ok((Offset::new(0), stored.high_watermark()))
    }

    async fn commit(
        &self,
        group: &GroupId,
        partition: &TopicPartition,
        offset: Offset,
    ) -> Result<(), LogError> {
        self.offsets
            .insert((group.clone(), partition.clone()), offset);
        debug!("Committed offset {} for group {} on {}", offset, group, partition);
        Ok(())
    }

    async fn committed(
        &self,
        group: &GroupId,
        partition: &TopicPartition,
    ) -> Result<Option<Offset>, LogError> {
        let key = (group.clone(), partition.clone());
        Ok(self.offsets.get(&key).map(|entry| *entry.value()))
    }

    /// A partition belongs to the first member of the group that claims it
    /// and is released when that member leaves.
    async fn join_group(
        &self,
        group: &GroupId,
        member: &str,
        topics: &[TopicName],
    ) -> Result<Vec<TopicPartition>, LogError> {
        let mut assigned = Vec::new();
        for topic in topics {
            self.ensure_topic(topic)?;
            for partition in self.partitions(topic).await? {
                let owner = self
                    .owners
                    .entry((group.clone(), partition.clone()))
                    .or_insert_with(|| member.to_string())
                    .value()
                    .clone();
                if owner == member {
                    assigned.push(partition);
                }
            }
        }
        info!(
            "Member {} joined group {} with {} partitions",
            member,
            group,
            assigned.len()
        );
        Ok(assigned)
    }

    async fn leave_group(&self, group: &GroupId, member: &str) -> Result<(), LogError> {
        self.owners
            .retain(|(owner_group, _), owner| !(owner_group == group && owner.as_str() == member));
        info!("Member {} left group {}", member, group);
        Ok(())
    }
}
