//! # Reactive-Kafka
//!
//! A small reactive publish/subscribe core with an at-least-once bridge to a
//! Kafka-like durable log.
//!
//! Hot streams fan every published item out to their current subscribers,
//! each of which pulls with its own demand. Pipelines chain filter, map and
//! tap stages onto a stream and reduce it into a single deferred result.
//!
//! ## Architecture
//!
//! - **Domain Layer**: streams, subscriptions, pipelines, deferred results and
//!   the records and offsets of the log
//! - **Application Layer**: the queue bridge producing to and consuming from
//!   a durable log
//! - **Infrastructure Layer**: the in-memory durable log
//!
//! ## Usage
//!
//! ```rust
//! use reactive_kafka::{HotStream, Pipeline};
//!
//! let stream: HotStream<String> = HotStream::new();
//! let upper = Pipeline::new()
//!     .map(|s: String| s.to_uppercase())
//!     .first(&stream);
//!
//! stream.publish("hello".to_string()).unwrap();
//! assert_eq!(upper.block().unwrap(), "HELLO");
//! ```

pub mod application;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use application::{
    ConsumerOptions, InboundStream, ProducerOptions, QueueBridge, QueueConsumer, QueueProducer,
    ReceivedRecord,
};
pub use domain::deferred::{DeferredResult, Resolver};
pub use domain::entities::{Ack, ProducerRecord, QueueRecord};
pub use domain::errors::StreamError;
pub use domain::hot_stream::HotStream;
pub use domain::pipeline::Pipeline;
pub use domain::subscription::{Subscriber, Subscription};
pub use domain::value_objects::{Offset, TopicName, TopicPartition};
pub use infrastructure::persistence::InMemoryLog;
