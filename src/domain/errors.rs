use std::time::Duration;
use thiserror::Error;

use super::value_objects::*;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("Invalid option: {0}")]
    InvalidOption(String),
}

/// Failures observed by stream consumers and deferred results.
///
/// Clonable because a stored outcome is handed out to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Stream already terminated")]
    Terminated,

    #[error("Transform stage failed: {0}")]
    Transform(String),

    #[error("Stream completed without emitting an item")]
    EmptyStream,

    #[error("Upstream failed: {0}")]
    Upstream(Cause),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,
}

/// Failures reported by a durable log implementation.
#[derive(Debug, Clone, Error)]
pub enum LogError {
    #[error("Topic '{0}' not found")]
    TopicNotFound(TopicName),

    #[error("Partition {0} does not exist")]
    PartitionNotFound(TopicPartition),

    #[error("Topic '{0}' already exists")]
    TopicAlreadyExists(TopicName),

    #[error("Record rejected: {0}")]
    Rejected(String),

    #[error("Log unavailable: {0}")]
    Unavailable(String),
}

impl From<DomainError> for LogError {
    fn from(err: DomainError) -> Self {
        LogError::Rejected(err.to_string())
    }
}
