use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::errors::LogError;
use super::value_objects::*;

/// A topic is a named set of partitions
#[derive(Debug, Clone)]
pub struct Topic {
    pub name: TopicName,
    pub partitions: Vec<Partition>,
    pub created_at: DateTime<Utc>,
    pub record_count: u64,
}

impl Topic {
    /// Create a new topic with `partition_count` empty partitions (at least one)
    pub fn new(name: TopicName, partition_count: u32) -> Self {
        Self {
            partitions: (0..partition_count.max(1))
                .map(|id| Partition::new(TopicPartition::new(name.clone(), PartitionId(id))))
                .collect(),
            name,
            created_at: Utc::now(),
            record_count: 0,
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Append a record to the given partition
    pub fn append(&mut self, partition: PartitionId, record: ProducerRecord) -> Result<QueueRecord, LogError> {
        let topic_partition = TopicPartition::new(self.name.clone(), partition);
        let stored = self
            .partitions
            .get_mut(partition.value() as usize)
            .ok_or(LogError::PartitionNotFound(topic_partition))?
            .append(record);
        self.record_count += 1;
        Ok(stored)
    }

    pub fn get_partition(&self, partition: PartitionId) -> Option<&Partition> {
        self.partitions.get(partition.value() as usize)
    }
}

/// An ordered, append-only sequence of records within a topic
#[derive(Debug, Clone)]
pub struct Partition {
    pub id: TopicPartition,
    pub records: Vec<QueueRecord>,
    pub high_watermark: Offset,
}

impl Partition {
    pub fn new(id: TopicPartition) -> Self {
        Self {
            id,
            records: Vec::new(),
            high_watermark: Offset::new(0),
        }
    }

    /// Append a record, assigning it the next offset
    pub fn append(&mut self, record: ProducerRecord) -> QueueRecord {
        let stored = QueueRecord {
            topic: self.id.topic.clone(),
            partition: self.id.partition,
            key: record.key,
            value: record.value,
            headers: record.headers,
            timestamp: Utc::now(),
            offset: self.high_watermark,
        };
        self.records.push(stored.clone());
        self.high_watermark = self.high_watermark.next();
        stored
    }

    /// Up to `limit` records starting at `from`
    pub fn read_from(&self, from: Offset, limit: usize) -> Vec<QueueRecord> {
        self.records
            .iter()
            .skip(from.value() as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Offset the next appended record will receive
    pub fn high_watermark(&self) -> Offset {
        self.high_watermark
    }
}

/// What a producer submits: the log assigns partition, offset and timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerRecord {
    pub topic: TopicName,
    pub key: Option<Bytes>,
    pub value: Bytes,
    /// Target partition; routed by key or round-robin when absent
    pub partition: Option<PartitionId>,
    pub headers: HashMap<String, String>,
}

impl ProducerRecord {
    pub fn new(topic: TopicName, value: impl Into<Bytes>) -> Self {
        Self {
            topic,
            key: None,
            value: value.into(),
            partition: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Size of key, value and headers in bytes
    pub fn size(&self) -> usize {
        self.value.len()
            + self.key.as_ref().map(|k| k.len()).unwrap_or(0)
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// A record as stored in the log. Immutable once its offset is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub offset: Offset,
}

impl QueueRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Value as UTF-8, replacing invalid sequences
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }

    pub fn key_str(&self) -> Option<String> {
        self.key
            .as_ref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
    }
}

/// Broker acknowledgment of a produced record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub offset: Offset,
    pub timestamp: DateTime<Utc>,
}

impl From<&QueueRecord> for Ack {
    fn from(record: &QueueRecord) -> Self {
        Self {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            timestamp: record.timestamp,
        }
    }
}
