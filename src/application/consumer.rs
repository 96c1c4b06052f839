use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::domain::{
    entities::QueueRecord,
    errors::{DomainError, LogError},
    events::{OffsetsCommitted, RebalanceEvent},
    hot_stream::HotStream,
    repositories::DurableLog,
    services::CommitBatcher,
    value_objects::*,
};

use super::options::{AutoOffsetReset, ConsumerOptions};

type AckSender = mpsc::UnboundedSender<(TopicPartition, Offset)>;

/// Handle used to acknowledge a received record.
///
/// Acknowledged offsets are committed in batches by the consumer that
/// delivered the record. Acknowledging after the consumer closed is a no-op.
#[derive(Debug, Clone)]
pub struct ReceiverOffset {
    partition: TopicPartition,
    offset: Offset,
    acks: AckSender,
}

impl ReceiverOffset {
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn acknowledge(&self) {
        if self
            .acks
            .send((self.partition.clone(), self.offset))
            .is_err()
        {
            debug!(
                "Dropping acknowledgment of {}@{}: consumer closed",
                self.partition, self.offset
            );
        }
    }
}

/// A record delivered by [`QueueConsumer`], dereferencing to the record
#[derive(Debug, Clone)]
pub struct ReceivedRecord {
    record: QueueRecord,
    receiver_offset: ReceiverOffset,
}

impl ReceivedRecord {
    fn new(record: QueueRecord, acks: AckSender) -> Self {
        let receiver_offset = ReceiverOffset {
            partition: record.topic_partition(),
            offset: record.offset,
            acks,
        };
        Self {
            record,
            receiver_offset,
        }
    }

    pub fn record(&self) -> &QueueRecord {
        &self.record
    }

    pub fn receiver_offset(&self) -> &ReceiverOffset {
        &self.receiver_offset
    }

    pub fn acknowledge(&self) {
        self.receiver_offset.acknowledge();
    }

    pub fn into_record(self) -> QueueRecord {
        self.record
    }
}

impl Deref for ReceivedRecord {
    type Target = QueueRecord;

    fn deref(&self) -> &QueueRecord {
        &self.record
    }
}

/// Opens inbound streams over a durable log
#[derive(Clone)]
pub struct QueueConsumer {
    log: Arc<dyn DurableLog>,
}

impl QueueConsumer {
    pub fn new(log: Arc<dyn DurableLog>) -> Self {
        Self { log }
    }

    /// Start a group member reading `options.topics`.
    ///
    /// Records are read only as fast as subscribers request them, so nothing
    /// is read before the returned stream has a subscriber with demand. Must
    /// be called from within a Tokio runtime.
    pub fn consume(&self, options: ConsumerOptions) -> Result<InboundStream, DomainError> {
        options.validate()?;

        let member_id = format!("{}-{}", options.client_id, Uuid::new_v4());
        let stream = HotStream::named(format!("{}:{}", options.group_id, member_id));
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            "Consumer {} subscribing to {:?} in group {}",
            member_id, options.topics, options.group_id
        );

        let worker = ConsumerLoop {
            log: Arc::clone(&self.log),
            stream: stream.clone(),
            member_id: member_id.clone(),
            options,
            acks_tx,
            acks_rx,
            shutdown: shutdown_rx,
            assigned: Vec::new(),
        };
        let task = tokio::spawn(worker.run());

        Ok(InboundStream {
            stream,
            member_id,
            shutdown: shutdown_tx,
            task: Some(task),
        })
    }
}

/// Live records of one consumer session.
///
/// Closing commits outstanding acknowledgments, leaves the group and
/// completes the stream. Dropping without closing does the same in the
/// background.
pub struct InboundStream {
    stream: HotStream<ReceivedRecord>,
    member_id: String,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl InboundStream {
    pub fn stream(&self) -> &HotStream<ReceivedRecord> {
        &self.stream
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// Whether the consumer task is still reading or committing
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Consumer {} task failed: {}", self.member_id, e);
            }
        }
    }
}

impl Drop for InboundStream {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundStream")
            .field("member_id", &self.member_id)
            .field("stream", &self.stream)
            .finish()
    }
}

struct ConsumerLoop {
    log: Arc<dyn DurableLog>,
    stream: HotStream<ReceivedRecord>,
    member_id: String,
    options: ConsumerOptions,
    acks_tx: AckSender,
    acks_rx: mpsc::UnboundedReceiver<(TopicPartition, Offset)>,
    shutdown: watch::Receiver<bool>,
    assigned: Vec<TopicPartition>,
}

impl ConsumerLoop {
    async fn run(mut self) {
        let mut positions = match self.join().await {
            Ok(positions) => positions,
            Err(e) => {
                error!("Consumer {} failed to join: {}", self.member_id, e);
                self.stream.fail(format!("Failed to join group: {}", e));
                self.leave().await;
                return;
            }
        };

        let mut batcher = CommitBatcher::new(self.options.commit_batch_size);
        for (partition, position) in &positions {
            batcher.start(partition.clone(), *position);
        }
        let mut poll_tick = tokio::time::interval(self.options.poll_interval_duration());
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commit_tick = tokio::time::interval(self.options.commit_interval_duration());
        commit_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        commit_tick.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    debug!("Consumer {} shutting down", self.member_id);
                    break;
                }
                Some((partition, offset)) = self.acks_rx.recv() => {
                    if batcher.acknowledge(partition, offset) {
                        if let Err(e) = self.commit(&mut batcher).await {
                            self.stream.fail(format!("Commit failed: {}", e));
                            break;
                        }
                    }
                }
                _ = commit_tick.tick() => {
                    if let Err(e) = self.commit(&mut batcher).await {
                        self.stream.fail(format!("Commit failed: {}", e));
                        break;
                    }
                }
                _ = poll_tick.tick() => {
                    if self.stream.is_terminated() {
                        break;
                    }
                    let budget = self.stream.outstanding_demand();
                    if budget == 0 {
                        continue;
                    }
                    if let Err(e) = self.poll(&mut positions, budget).await {
                        error!("Consumer {} read failed: {}", self.member_id, e);
                        self.stream.fail(format!("Read failed: {}", e));
                        break;
                    }
                }
            }
        }

        while let Ok((partition, offset)) = self.acks_rx.try_recv() {
            batcher.acknowledge(partition, offset);
        }
        if let Err(e) = self.commit(&mut batcher).await {
            warn!("Consumer {} final commit failed: {}", self.member_id, e);
        }
        self.leave().await;
        self.stream.complete();
        info!("Consumer {} closed", self.member_id);
    }

    /// Join the group and resolve a start position per assigned partition
    async fn join(&mut self) -> Result<BTreeMap<TopicPartition, Offset>, LogError> {
        let group = &self.options.group_id;
        self.assigned = self
            .log
            .join_group(group, &self.member_id, &self.options.topics)
            .await?;

        let mut positions = BTreeMap::new();
        for partition in &self.assigned {
            let position = match self.options.start_offset {
                Some(explicit) => Offset(explicit),
                None => match self.log.committed(group, partition).await? {
                    Some(committed) => committed,
                    None => {
                        let (earliest, latest) = self.log.offset_range(partition).await?;
                        match self.options.auto_offset_reset {
                            AutoOffsetReset::Earliest => earliest,
                            AutoOffsetReset::Latest => latest,
                        }
                    }
                },
            };
            debug!("Consumer {} starts {} at {}", self.member_id, partition, position);
            positions.insert(partition.clone(), position);
        }

        self.emit(&RebalanceEvent::assigned(
            group.clone(),
            self.assigned.clone(),
        ));
        Ok(positions)
    }

    /// Read and publish at most `budget` records across the assigned
    /// partitions, so nothing is read that no subscriber asked for.
    async fn poll(
        &self,
        positions: &mut BTreeMap<TopicPartition, Offset>,
        budget: u64,
    ) -> Result<(), LogError> {
        let mut remaining = budget;
        for (partition, position) in positions.iter_mut() {
            if remaining == 0 {
                break;
            }
            let limit = remaining.min(self.options.max_poll_records as u64) as usize;
            let records = self.log.read_from(partition, *position, limit).await?;
            for record in records {
                *position = record.offset.next();
                remaining = remaining.saturating_sub(1);
                let received = ReceivedRecord::new(record, self.acks_tx.clone());
                if self.stream.publish(received).is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn commit(&self, batcher: &mut CommitBatcher) -> Result<(), LogError> {
        let offsets = batcher.take();
        if offsets.is_empty() {
            return Ok(());
        }
        let group = &self.options.group_id;
        for (partition, offset) in &offsets {
            self.log.commit(group, partition, *offset).await?;
        }
        debug!(
            "Consumer {} committed {} partitions",
            self.member_id,
            offsets.len()
        );

        let event = OffsetsCommitted::new(group.clone(), offsets);
        for listener in self.options.commit_listeners() {
            listener(&event);
        }
        Ok(())
    }

    async fn leave(&self) {
        let group = &self.options.group_id;
        if !self.assigned.is_empty() {
            self.emit(&RebalanceEvent::revoked(
                group.clone(),
                self.assigned.clone(),
            ));
        }
        if let Err(e) = self.log.leave_group(group, &self.member_id).await {
            warn!("Consumer {} failed to leave group {}: {}", self.member_id, group, e);
        }
    }

    fn emit(&self, event: &RebalanceEvent) {
        debug!("Consumer {}: {:?}", self.member_id, event);
        for listener in self.options.rebalance_listeners() {
            listener(event);
        }
    }
}
