use std::sync::Arc;

use crate::domain::{
    deferred::DeferredResult,
    entities::{Ack, ProducerRecord},
    errors::DomainError,
    repositories::DurableLog,
};

use super::consumer::{InboundStream, QueueConsumer};
use super::options::{ConsumerOptions, ProducerOptions};
use super::producer::{QueueProducer, SenderRecord, SenderResult};

/// Producer and consumer sides sharing one durable log
#[derive(Clone)]
pub struct QueueBridge {
    log: Arc<dyn DurableLog>,
    producer: QueueProducer,
    consumer: QueueConsumer,
}

impl QueueBridge {
    pub fn new(log: Arc<dyn DurableLog>, producer_options: ProducerOptions) -> Self {
        Self {
            producer: QueueProducer::new(Arc::clone(&log), producer_options),
            consumer: QueueConsumer::new(Arc::clone(&log)),
            log,
        }
    }

    pub fn log(&self) -> &Arc<dyn DurableLog> {
        &self.log
    }

    pub fn producer(&self) -> &QueueProducer {
        &self.producer
    }

    pub fn produce(&self, record: ProducerRecord) -> DeferredResult<Ack> {
        self.producer.produce(record)
    }

    pub fn send_all<C, I>(&self, records: I) -> DeferredResult<Vec<SenderResult<C>>>
    where
        C: Clone + Send + 'static,
        I: IntoIterator<Item = SenderRecord<C>>,
    {
        self.producer.send_all(records)
    }

    pub fn consume(&self, options: ConsumerOptions) -> Result<InboundStream, DomainError> {
        self.consumer.consume(options)
    }
}
