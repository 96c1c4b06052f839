use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{
    errors::DomainError,
    events::{OffsetsCommitted, RebalanceEvent},
    value_objects::*,
};

pub type RebalanceListener = Arc<dyn Fn(&RebalanceEvent) + Send + Sync>;
pub type CommitListener = Arc<dyn Fn(&OffsetsCommitted) + Send + Sync>;

/// Producer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerOptions {
    pub client_id: String,
    /// How long a produce waits for the log to acknowledge
    pub ack_timeout_ms: u64,
    /// Keep sending the rest of a batch after a failed record
    pub delay_error: bool,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            client_id: "reactive-producer".to_string(),
            ack_timeout_ms: 30_000,
            delay_error: false,
        }
    }
}

impl ProducerOptions {
    pub fn from_json(json: &str) -> Result<Self, DomainError> {
        serde_json::from_str(json).map_err(|e| DomainError::InvalidOption(e.to_string()))
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn delay_error(mut self, delay: bool) -> Self {
        self.delay_error = delay;
        self
    }

    pub fn ack_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Where a consumer starts when its group has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoOffsetReset {
    Earliest,
    #[default]
    Latest,
}

/// Consumer configuration, including side-channel listeners
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    pub client_id: String,
    pub group_id: GroupId,
    pub topics: Vec<TopicName>,
    pub auto_offset_reset: AutoOffsetReset,
    /// Start every assigned partition here instead of the committed offset
    pub start_offset: Option<u64>,
    /// Acknowledgments per commit
    pub commit_batch_size: usize,
    pub commit_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub max_poll_records: usize,
    #[serde(skip)]
    rebalance_listeners: Vec<RebalanceListener>,
    #[serde(skip)]
    commit_listeners: Vec<CommitListener>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            client_id: "reactive-consumer".to_string(),
            group_id: GroupId::new("reactive-group"),
            topics: Vec::new(),
            auto_offset_reset: AutoOffsetReset::default(),
            start_offset: None,
            commit_batch_size: 10,
            commit_interval_ms: 5_000,
            poll_interval_ms: 50,
            max_poll_records: 500,
            rebalance_listeners: Vec::new(),
            commit_listeners: Vec::new(),
        }
    }
}

impl ConsumerOptions {
    pub fn new(topics: impl IntoIterator<Item = TopicName>) -> Self {
        Self {
            topics: topics.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, DomainError> {
        let options: Self =
            serde_json::from_str(json).map_err(|e| DomainError::InvalidOption(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.topics.is_empty() {
            return Err(DomainError::InvalidOption(
                "at least one topic is required".to_string(),
            ));
        }
        for topic in &self.topics {
            TopicName::new(topic.0.clone())?;
        }
        if self.commit_batch_size == 0 {
            return Err(DomainError::InvalidOption(
                "commit_batch_size must be positive".to_string(),
            ));
        }
        if self.max_poll_records == 0 {
            return Err(DomainError::InvalidOption(
                "max_poll_records must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = GroupId::new(group_id);
        self
    }

    pub fn auto_offset_reset(mut self, reset: AutoOffsetReset) -> Self {
        self.auto_offset_reset = reset;
        self
    }

    pub fn start_offset(mut self, offset: Offset) -> Self {
        self.start_offset = Some(offset.value());
        self
    }

    pub fn commit_batch_size(mut self, size: usize) -> Self {
        self.commit_batch_size = size;
        self
    }

    pub fn commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn max_poll_records(mut self, max: usize) -> Self {
        self.max_poll_records = max;
        self
    }

    pub fn add_rebalance_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&RebalanceEvent) + Send + Sync + 'static,
    {
        self.rebalance_listeners.push(Arc::new(listener));
        self
    }

    pub fn add_assign_listener<F>(self, listener: F) -> Self
    where
        F: Fn(&[TopicPartition]) + Send + Sync + 'static,
    {
        self.add_rebalance_listener(move |event| {
            if let RebalanceEvent::PartitionsAssigned(change) = event {
                listener(&change.partitions);
            }
        })
    }

    pub fn add_revoke_listener<F>(self, listener: F) -> Self
    where
        F: Fn(&[TopicPartition]) + Send + Sync + 'static,
    {
        self.add_rebalance_listener(move |event| {
            if let RebalanceEvent::PartitionsRevoked(change) = event {
                listener(&change.partitions);
            }
        })
    }

    pub fn add_commit_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&OffsetsCommitted) + Send + Sync + 'static,
    {
        self.commit_listeners.push(Arc::new(listener));
        self
    }

    pub fn commit_interval_duration(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms.max(1))
    }

    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub(crate) fn rebalance_listeners(&self) -> &[RebalanceListener] {
        &self.rebalance_listeners
    }

    pub(crate) fn commit_listeners(&self) -> &[CommitListener] {
        &self.commit_listeners
    }
}

impl fmt::Debug for ConsumerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerOptions")
            .field("client_id", &self.client_id)
            .field("group_id", &self.group_id)
            .field("topics", &self.topics)
            .field("auto_offset_reset", &self.auto_offset_reset)
            .field("start_offset", &self.start_offset)
            .field("commit_batch_size", &self.commit_batch_size)
            .field("commit_interval_ms", &self.commit_interval_ms)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("max_poll_records", &self.max_poll_records)
            .field("rebalance_listeners", &self.rebalance_listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_options_from_json() {
        let options = ConsumerOptions::from_json(
            r#"{
                "client_id": "test-consumer",
                "group_id": "test-group",
                "topics": ["test-topic"],
                "auto_offset_reset": "earliest",
                "commit_batch_size": 10
            }"#,
        )
        .unwrap();

        assert_eq!(options.client_id, "test-consumer");
        assert_eq!(options.group_id, GroupId::from("test-group"));
        assert_eq!(options.topics, vec![TopicName::from("test-topic")]);
        assert_eq!(options.auto_offset_reset, AutoOffsetReset::Earliest);
        assert_eq!(options.max_poll_records, 500);
    }

    #[test]
    fn consumer_options_validation() {
        assert!(ConsumerOptions::default().validate().is_err());
        assert!(ConsumerOptions::new([TopicName::from("t")])
            .commit_batch_size(0)
            .validate()
            .is_err());
        assert!(ConsumerOptions::new([TopicName::from("bad topic")])
            .validate()
            .is_err());
        assert!(ConsumerOptions::new([TopicName::from("t")]).validate().is_ok());
    }

    #[test]
    fn producer_options_defaults_and_json() {
        let options = ProducerOptions::from_json(r#"{"client_id": "test-producer"}"#).unwrap();
        assert_eq!(options.client_id, "test-producer");
        assert_eq!(options.ack_timeout_duration(), Duration::from_secs(30));
        assert!(!options.delay_error);
    }
}
