//! Integration tests for the stream core and the queue bridge
//!
//! These run producers and consumers against the in-memory log the way an
//! application would wire them together.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use reactive_kafka::application::*;
use reactive_kafka::domain::*;
use reactive_kafka::infrastructure::InMemoryLog;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn topic() -> TopicName {
    TopicName::from("test-topic")
}

fn bridge(log: &InMemoryLog) -> QueueBridge {
    QueueBridge::new(Arc::new(log.clone()), ProducerOptions::default())
}

fn consumer_options() -> ConsumerOptions {
    ConsumerOptions::new([topic()])
        .group_id("test-group")
        .client_id("test-consumer")
        .auto_offset_reset(AutoOffsetReset::Earliest)
        .poll_interval(Duration::from_millis(10))
        .commit_interval(Duration::from_secs(60))
}

async fn produce_values(bridge: &QueueBridge, values: impl IntoIterator<Item = String>) {
    for value in values {
        bridge
            .produce(ProducerRecord::new(topic(), value))
            .wait()
            .await
            .unwrap();
    }
}

/// Poll `condition` until it holds or two seconds pass
async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[test]
fn test_blocking_consumer_across_threads() {
    init_logging();
    let stream: HotStream<String> = HotStream::named("blocking");
    let result = Pipeline::new()
        .filter(|s: &String| s.starts_with('A'))
        .collect(&stream);

    let publisher = {
        let stream = stream.clone();
        std::thread::spawn(move || {
            for value in ["A1", "B1", "A2", "B2"] {
                stream.publish(value.to_string()).unwrap();
            }
            stream.complete();
        })
    };

    assert_eq!(
        result.block_timeout(Duration::from_secs(5)).unwrap(),
        vec!["A1".to_string(), "A2".to_string()]
    );
    publisher.join().unwrap();
}

#[test]
fn test_wait_timeout_leaves_subscription_running() {
    init_logging();
    let stream: HotStream<u32> = HotStream::new();
    let first = Pipeline::new().first(&stream);

    assert_eq!(
        first.block_timeout(Duration::from_millis(20)),
        Err(StreamError::Timeout(Duration::from_millis(20)))
    );
    assert_eq!(stream.subscriber_count(), 1);

    stream.publish(7).unwrap();
    assert_eq!(first.block().unwrap(), 7);
    assert_eq!(stream.subscriber_count(), 0);
}

#[tokio::test]
async fn test_produce_acknowledges_offsets() {
    init_logging();
    let log = InMemoryLog::new();
    let bridge = bridge(&log);

    let first = bridge.produce(ProducerRecord::new(topic(), "Message_1"));
    let second = bridge.produce(ProducerRecord::new(topic(), "Message_2"));

    let mut offsets = vec![
        first.wait().await.unwrap().offset,
        second.wait().await.unwrap().offset,
    ];
    offsets.sort();
    assert_eq!(offsets, vec![Offset(0), Offset(1)]);
    assert_eq!(log.record_count(&topic()), 2);
}

#[tokio::test]
async fn test_stalled_produce_times_out_without_storing() {
    init_logging();
    let log = InMemoryLog::new();
    log.stall_appends(true);
    let bridge = QueueBridge::new(
        Arc::new(log.clone()),
        ProducerOptions::default().ack_timeout(Duration::from_millis(50)),
    );

    let err = bridge
        .produce(ProducerRecord::new(topic(), "never acknowledged"))
        .wait()
        .await
        .unwrap_err();

    assert_eq!(err, StreamError::Timeout(Duration::from_millis(50)));
    assert_eq!(log.record_count(&topic()), 0);
}

#[tokio::test]
async fn test_send_all_echoes_correlation() {
    init_logging();
    let log = InMemoryLog::new();
    let bridge = bridge(&log);

    let records = (0..5).map(|i| {
        SenderRecord::new(
            ProducerRecord::new(topic(), format!("Message_{}", i)),
            format!("correlation-{}", i),
        )
    });
    let results = bridge.send_all(records).wait().await.unwrap();

    assert_eq!(results.len(), 5);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.correlation, format!("correlation-{}", i));
        assert_eq!(result.outcome.as_ref().unwrap().offset, Offset(i as u64));
    }
}

#[tokio::test]
async fn test_consume_commits_acknowledged_batches() {
    init_logging();
    let log = InMemoryLog::new();
    let bridge = bridge(&log);
    produce_values(&bridge, (0..7).map(|i| format!("Message_{}", i))).await;

    let commits = Arc::new(Mutex::new(Vec::new()));
    let options = {
        let commits = Arc::clone(&commits);
        consumer_options()
            .commit_batch_size(3)
            .add_commit_listener(move |event| commits.lock().push(event.offsets.clone()))
    };

    let inbound = bridge.consume(options).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        inbound.stream().subscribe_fn(move |record: ReceivedRecord| {
            received.lock().push(record.value_str());
            record.acknowledge();
        });
    }

    assert!(eventually(|| received.lock().len() == 7).await);
    assert!(eventually(|| commits.lock().len() == 2).await);

    let tp = TopicPartition::new(topic(), PartitionId(0));
    let group = GroupId::from("test-group");
    assert_eq!(
        log.committed(&group, &tp).await.unwrap(),
        Some(Offset(6))
    );

    inbound.close().await;
    assert_eq!(
        log.committed(&group, &tp).await.unwrap(),
        Some(Offset(7))
    );
    assert_eq!(
        *received.lock(),
        (0..7).map(|i| format!("Message_{}", i)).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_unacknowledged_records_are_redelivered() {
    init_logging();
    let log = InMemoryLog::new();
    let bridge = bridge(&log);
    produce_values(&bridge, (0..5).map(|i| format!("Message_{}", i))).await;

    let inbound = bridge.consume(consumer_options()).unwrap();
    let first_session = Pipeline::new()
        .tap(|record: &ReceivedRecord| {
            if record.offset < Offset(2) {
                record.acknowledge();
            }
        })
        .collect(inbound.stream());
    assert!(eventually(|| inbound.stream().subscriber_count() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    inbound.close().await;
    assert_eq!(first_session.wait().await.unwrap().len(), 5);

    let inbound = bridge.consume(consumer_options()).unwrap();
    let first = Pipeline::new().first(inbound.stream());
    let redelivered = first.wait_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!(redelivered.offset, Offset(2));
    assert_eq!(redelivered.value_str(), "Message_2");
    inbound.close().await;
}

#[tokio::test]
async fn test_reading_waits_for_a_subscriber() {
    init_logging();
    let log = InMemoryLog::new();
    let bridge = bridge(&log);
    produce_values(&bridge, ["A".to_string(), "B".to_string()]).await;

    let inbound = bridge.consume(consumer_options()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let collected = Pipeline::new().collect(inbound.stream());
    tokio::time::sleep(Duration::from_millis(100)).await;
    inbound.close().await;

    let values: Vec<String> = collected
        .wait()
        .await
        .unwrap()
        .iter()
        .map(|r| r.value_str())
        .collect();
    assert_eq!(values, vec!["A".to_string(), "B".to_string()]);
}

#[tokio::test]
async fn test_latest_reset_skips_existing_records() {
    init_logging();
    let log = InMemoryLog::new();
    let bridge = bridge(&log);
    produce_values(&bridge, ["old".to_string()]).await;

    let inbound = bridge
        .consume(consumer_options().auto_offset_reset(AutoOffsetReset::Latest))
        .unwrap();
    let first = Pipeline::new().first(inbound.stream());
    tokio::time::sleep(Duration::from_millis(100)).await;
    produce_values(&bridge, ["new".to_string()]).await;

    let record = first.wait_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!(record.value_str(), "new");
    assert_eq!(record.offset, Offset(1));
    inbound.close().await;
}

#[tokio::test]
async fn test_read_failure_fails_the_stream() {
    init_logging();
    let log = InMemoryLog::new();
    let bridge = bridge(&log);
    produce_values(&bridge, ["x".to_string()]).await;
    log.fail_reads(Some("broker not available"));

    let revoked = Arc::new(Mutex::new(Vec::new()));
    let options = {
        let revoked = Arc::clone(&revoked);
        consumer_options().add_revoke_listener(move |partitions| {
            revoked.lock().extend_from_slice(partitions)
        })
    };
    let inbound = bridge.consume(options).unwrap();
    let collected = Pipeline::new().collect(inbound.stream());

    match collected.wait_timeout(Duration::from_secs(2)).await {
        Err(StreamError::Upstream(cause)) => {
            assert!(cause.message().contains("broker not available"))
        }
        other => panic!("expected upstream failure, got {:?}", other.map(|r| r.len())),
    }
    assert!(eventually(|| revoked.lock().len() == 1).await);
    assert!(inbound.stream().is_terminated());
}

#[tokio::test]
async fn test_rebalance_listeners_and_group_ownership() {
    init_logging();
    let log = InMemoryLog::new().with_default_partitions(3);
    let bridge = bridge(&log);

    let events = Arc::new(Mutex::new(Vec::new()));
    let options = {
        let events = Arc::clone(&events);
        consumer_options().add_rebalance_listener(move |event| events.lock().push(event.clone()))
    };

    let first = bridge.consume(options).unwrap();
    assert!(eventually(|| events.lock().len() == 1).await);
    match &events.lock()[0] {
        RebalanceEvent::PartitionsAssigned(change) => {
            assert_eq!(change.partitions.len(), 3);
            assert_eq!(change.group, GroupId::from("test-group"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    let second_assigned = Arc::new(Mutex::new(None));
    let second = {
        let second_assigned = Arc::clone(&second_assigned);
        bridge
            .consume(consumer_options().add_assign_listener(move |partitions| {
                *second_assigned.lock() = Some(partitions.len())
            }))
            .unwrap()
    };
    assert!(eventually(|| second_assigned.lock().is_some()).await);
    assert_eq!(*second_assigned.lock(), Some(0));

    first.close().await;
    second.close().await;

    let events = events.lock();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[1], RebalanceEvent::PartitionsRevoked(_)));
    assert_eq!(events[1].partitions().len(), 3);
}

#[tokio::test]
async fn test_close_completes_the_stream() {
    init_logging();
    let log = InMemoryLog::new();
    let bridge = bridge(&log);

    let inbound = bridge.consume(consumer_options()).unwrap();
    let stream = inbound.stream().clone();
    let none = Pipeline::new().first(&stream);
    inbound.close().await;

    assert_eq!(none.wait().await.unwrap_err(), StreamError::EmptyStream);
    assert!(stream.is_terminated());
    assert_eq!(stream.subscriber_count(), 0);
}

#[tokio::test]
async fn test_commit_stops_at_the_first_unacknowledged_offset() {
    init_logging();
    let log = InMemoryLog::new();
    let bridge = bridge(&log);
    produce_values(&bridge, (0..3).map(|i| format!("Message_{}", i))).await;

    let inbound = bridge
        .consume(consumer_options().commit_batch_size(1))
        .unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        inbound.stream().subscribe_fn(move |record: ReceivedRecord| {
            received.lock().push(record.offset);
            if record.offset != Offset(1) {
                record.acknowledge();
            }
        });
    }
    assert!(eventually(|| received.lock().len() == 3).await);
    inbound.close().await;

    let tp = TopicPartition::new(topic(), PartitionId(0));
    let group = GroupId::from("test-group");
    assert_eq!(log.committed(&group, &tp).await.unwrap(), Some(Offset(1)));

    let inbound = bridge.consume(consumer_options()).unwrap();
    let redelivered = Pipeline::new()
        .map(|record: ReceivedRecord| record.offset)
        .first(inbound.stream());
    assert_eq!(
        redelivered.wait_timeout(Duration::from_secs(2)).await,
        Ok(Offset(1))
    );
    inbound.close().await;
}

#[tokio::test]
async fn test_out_of_order_acknowledgment_commits_nothing_past_a_gap() {
    init_logging();
    let log = InMemoryLog::new();
    let bridge = bridge(&log);
    produce_values(&bridge, (0..3).map(|i| format!("Message_{}", i))).await;

    let inbound = bridge
        .consume(consumer_options().commit_batch_size(1))
        .unwrap();
    let last = Pipeline::new()
        .filter(|record: &ReceivedRecord| record.offset == Offset(2))
        .tap(|record: &ReceivedRecord| record.acknowledge())
        .first(inbound.stream());
    last.wait_timeout(Duration::from_secs(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    inbound.close().await;

    let tp = TopicPartition::new(topic(), PartitionId(0));
    let group = GroupId::from("test-group");
    assert_eq!(log.committed(&group, &tp).await.unwrap(), None);

    let inbound = bridge.consume(consumer_options()).unwrap();
    let first = Pipeline::new().first(inbound.stream());
    let redelivered = first.wait_timeout(Duration::from_secs(2)).await.unwrap();
    assert_eq!(redelivered.offset, Offset(0));
    inbound.close().await;
}

#[tokio::test]
async fn test_polling_follows_subscriber_demand() {
    struct OneAtATime {
        seen: Arc<Mutex<Vec<Offset>>>,
    }

    impl Subscriber<ReceivedRecord> for OneAtATime {
        fn on_subscribe(&mut self, subscription: Subscription<ReceivedRecord>) {
            subscription.request(1);
        }

        fn on_next(&mut self, record: ReceivedRecord) {
            self.seen.lock().push(record.offset);
        }
    }

    init_logging();
    let log = InMemoryLog::new();
    let bridge = bridge(&log);
    produce_values(&bridge, (0..200).map(|i| format!("Message_{}", i))).await;

    let inbound = bridge.consume(consumer_options()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscription = inbound.stream().subscribe(OneAtATime {
        seen: Arc::clone(&seen),
    });

    assert!(eventually(|| subscription.delivered() == 1).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(subscription.delivered(), 1);
    assert_eq!(subscription.buffered(), 0);

    subscription.request(5);
    assert!(eventually(|| subscription.delivered() == 6).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(subscription.buffered(), 0);
    assert_eq!(*seen.lock(), (0..6).map(Offset).collect::<Vec<_>>());

    inbound.close().await;
}
