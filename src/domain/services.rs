use crc32fast::Hasher as Crc32Hasher;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};

use super::{entities::*, value_objects::*};

/// Chooses the partition a produced record lands in
#[derive(Debug, Default)]
pub struct PartitionRouter {
    next: AtomicU32,
}

impl PartitionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit partition wins, then key hash, then round-robin
    pub fn route(&self, record: &ProducerRecord, partition_count: u32) -> PartitionId {
        let partition_count = partition_count.max(1);
        if let Some(partition) = record.partition {
            return partition;
        }
        match &record.key {
            Some(key) => {
                let mut hasher = Crc32Hasher::new();
                hasher.update(key);
                PartitionId(hasher.finalize() % partition_count)
            }
            None => PartitionId(self.next.fetch_add(1, Ordering::Relaxed) % partition_count),
        }
    }
}

/// Tracks acknowledged offsets and decides when a commit is due.
///
/// A partition's commit position is "next offset to read" and only covers the
/// unbroken run of acknowledged offsets from where the session started
/// reading it. Acknowledgments past a gap wait until the gap closes, and a
/// position never moves backwards.
#[derive(Debug)]
pub struct CommitBatcher {
    batch_size: usize,
    partitions: BTreeMap<TopicPartition, PartitionProgress>,
    acknowledged: usize,
}

#[derive(Debug)]
struct PartitionProgress {
    /// Every offset below this one is acknowledged.
    position: Offset,
    /// Acknowledged offsets above `position`, waiting for the gap to close.
    ahead: BTreeSet<Offset>,
    /// `position` moved since the last batch was taken.
    dirty: bool,
}

impl CommitBatcher {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            partitions: BTreeMap::new(),
            acknowledged: 0,
        }
    }

    /// Register the offset this session starts reading `partition` at.
    pub fn start(&mut self, partition: TopicPartition, position: Offset) {
        self.partitions.insert(
            partition,
            PartitionProgress {
                position,
                ahead: BTreeSet::new(),
                dirty: false,
            },
        );
    }

    /// Record an acknowledgment. Returns true when a batch is full.
    pub fn acknowledge(&mut self, partition: TopicPartition, offset: Offset) -> bool {
        let Some(progress) = self.partitions.get_mut(&partition) else {
            warn!("Ignoring acknowledgment of {}@{}: partition not assigned", partition, offset);
            return false;
        };
        if offset < progress.position || !progress.ahead.insert(offset) {
            debug!("Ignoring repeated acknowledgment of {}@{}", partition, offset);
            return false;
        }
        while progress.ahead.remove(&progress.position) {
            progress.position = progress.position.next();
            progress.dirty = true;
        }
        self.acknowledged += 1;
        self.acknowledged >= self.batch_size
    }

    /// Positions that moved since the last call, starting a new batch.
    pub fn take(&mut self) -> Vec<(TopicPartition, Offset)> {
        let moved: Vec<_> = self
            .partitions
            .iter_mut()
            .filter(|(_, progress)| progress.dirty)
            .map(|(partition, progress)| {
                progress.dirty = false;
                (partition.clone(), progress.position)
            })
            .collect();
        if !moved.is_empty() {
            debug!(
                "Taking commit batch of {} partitions after {} acknowledgments",
                moved.len(),
                self.acknowledged
            );
        }
        self.acknowledged = 0;
        moved
    }
}
