use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{
    deferred::{DeferredResult, Outcome},
    entities::*,
    errors::{LogError, StreamError},
    repositories::DurableLog,
};

use super::options::ProducerOptions;

/// A record to send together with caller metadata echoed back in its result
#[derive(Debug, Clone)]
pub struct SenderRecord<C> {
    pub record: ProducerRecord,
    pub correlation: C,
}

impl<C> SenderRecord<C> {
    pub fn new(record: ProducerRecord, correlation: C) -> Self {
        Self { record, correlation }
    }
}

/// Outcome of one [`SenderRecord`]
#[derive(Debug, Clone)]
pub struct SenderResult<C> {
    pub correlation: C,
    pub outcome: Outcome<Ack>,
}

impl<C> SenderResult<C> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Publishes records to the durable log and reports acknowledgments.
///
/// Each send runs on its own Tokio task, so these methods must be called
/// from within a runtime. Failed sends are reported, never retried.
#[derive(Clone)]
pub struct QueueProducer {
    log: Arc<dyn DurableLog>,
    options: ProducerOptions,
}

impl QueueProducer {
    pub fn new(log: Arc<dyn DurableLog>, options: ProducerOptions) -> Self {
        Self { log, options }
    }

    pub fn options(&self) -> &ProducerOptions {
        &self.options
    }

    /// Send one record; resolves with its ack or the reason it was not stored
    pub fn produce(&self, record: ProducerRecord) -> DeferredResult<Ack> {
        let (resolver, result) = DeferredResult::channel();
        let log = Arc::clone(&self.log);
        let timeout = self.options.ack_timeout_duration();

        debug!(
            "[{}] Producing {} bytes to {}",
            self.options.client_id,
            record.size(),
            record.topic
        );

        let task_resolver = resolver.clone();
        let task = tokio::spawn(async move {
            let outcome = send_one(log.as_ref(), record, timeout).await;
            task_resolver.resolve(outcome);
        });
        resolver.on_cancel(move || task.abort());
        result
    }

    /// Send records in order. Without `delay_error` the batch stops at the
    /// first failure, whose result is the last one returned.
    pub fn send_all<C, I>(&self, records: I) -> DeferredResult<Vec<SenderResult<C>>>
    where
        C: Clone + Send + 'static,
        I: IntoIterator<Item = SenderRecord<C>>,
    {
        let records: Vec<SenderRecord<C>> = records.into_iter().collect();
        let (resolver, result) = DeferredResult::channel();
        let log = Arc::clone(&self.log);
        let timeout = self.options.ack_timeout_duration();
        let delay_error = self.options.delay_error;
        let client_id = self.options.client_id.clone();

        info!("[{}] Sending batch of {} records", client_id, records.len());

        let task_resolver = resolver.clone();
        let task = tokio::spawn(async move {
            let mut results = Vec::with_capacity(records.len());
            for SenderRecord { record, correlation } in records {
                let outcome = send_one(log.as_ref(), record, timeout).await;
                let failed = outcome.is_err();
                if let Err(e) = &outcome {
                    error!("[{}] Send failed: {}", client_id, e);
                }
                results.push(SenderResult { correlation, outcome });
                if failed && !delay_error {
                    break;
                }
            }
            task_resolver.succeed(results);
        });
        resolver.on_cancel(move || task.abort());
        result
    }
}

async fn send_one(log: &dyn DurableLog, record: ProducerRecord, timeout: Duration) -> Outcome<Ack> {
    match tokio::time::timeout(timeout, log.append(record)).await {
        Ok(Ok(stored)) => {
            debug!(
                "Acknowledged offset {} in {}",
                stored.offset,
                stored.topic_partition()
            );
            Ok(Ack::from(&stored))
        }
        Ok(Err(e)) => Err(send_error(e)),
        Err(_) => Err(StreamError::Timeout(timeout)),
    }
}

fn send_error(err: LogError) -> StreamError {
    StreamError::Send(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::*;
    use crate::infrastructure::InMemoryLog;

    fn producer(log: &InMemoryLog, options: ProducerOptions) -> QueueProducer {
        QueueProducer::new(Arc::new(log.clone()), options)
    }

    #[tokio::test]
    async fn produce_resolves_with_ack() {
        let log = InMemoryLog::new();
        let producer = producer(&log, ProducerOptions::default());

        let ack = producer
            .produce(ProducerRecord::new(TopicName::from("test-topic"), "Message_1"))
            .wait()
            .await
            .unwrap();

        assert_eq!(ack.offset, Offset(0));
        assert_eq!(ack.topic, TopicName::from("test-topic"));
    }

    #[tokio::test]
    async fn rejected_append_is_a_send_error() {
        let log = InMemoryLog::new();
        log.reject_appends(Some("record too large"));
        let producer = producer(&log, ProducerOptions::default());

        let err = producer
            .produce(ProducerRecord::new(TopicName::from("test-topic"), "x"))
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Send(ref reason) if reason.contains("record too large")));
    }

    #[tokio::test]
    async fn batch_stops_at_first_failure_unless_delayed() {
        let log = InMemoryLog::new().with_auto_create_topics(false);
        log.create_topic(&TopicName::from("known"), 1).await.unwrap();
        let records = || {
            vec![
                SenderRecord::new(ProducerRecord::new(TopicName::from("known"), "a"), 1),
                SenderRecord::new(ProducerRecord::new(TopicName::from("missing"), "b"), 2),
                SenderRecord::new(ProducerRecord::new(TopicName::from("known"), "c"), 3),
            ]
        };

        let results = producer(&log, ProducerOptions::default())
            .send_all(records())
            .wait()
            .await
            .unwrap();
        let correlations: Vec<i32> = results.iter().map(|r| r.correlation).collect();
        assert_eq!(correlations, vec![1, 2]);
        assert!(results[0].is_ok());
        assert!(!results[1].is_ok());

        let results = producer(&log, ProducerOptions::default().delay_error(true))
            .send_all(records())
            .wait()
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[2].is_ok());
        assert_eq!(log.record_count(&TopicName::from("known")), 3);
    }
}
