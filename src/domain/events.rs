use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value_objects::*;

/// Side-channel notification about partition ownership of a consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebalanceEvent {
    PartitionsAssigned(PartitionsChanged),
    PartitionsRevoked(PartitionsChanged),
}

impl RebalanceEvent {
    pub fn assigned(group: GroupId, partitions: Vec<TopicPartition>) -> Self {
        RebalanceEvent::PartitionsAssigned(PartitionsChanged::new(group, partitions))
    }

    pub fn revoked(group: GroupId, partitions: Vec<TopicPartition>) -> Self {
        RebalanceEvent::PartitionsRevoked(PartitionsChanged::new(group, partitions))
    }

    pub fn partitions(&self) -> &[TopicPartition] {
        match self {
            RebalanceEvent::PartitionsAssigned(change) | RebalanceEvent::PartitionsRevoked(change) => {
                &change.partitions
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionsChanged {
    pub group: GroupId,
    pub partitions: Vec<TopicPartition>,
    pub timestamp: DateTime<Utc>,
}

impl PartitionsChanged {
    pub fn new(group: GroupId, partitions: Vec<TopicPartition>) -> Self {
        Self {
            group,
            partitions,
            timestamp: Utc::now(),
        }
    }
}

/// Emitted after a batch of acknowledged offsets reached the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetsCommitted {
    pub group: GroupId,
    pub offsets: Vec<(TopicPartition, Offset)>,
    pub timestamp: DateTime<Utc>,
}

impl OffsetsCommitted {
    pub fn new(group: GroupId, offsets: Vec<(TopicPartition, Offset)>) -> Self {
        Self {
            group,
            offsets,
            timestamp: Utc::now(),
        }
    }
}
