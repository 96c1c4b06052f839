use clap::Parser;
use log::info;
use std::sync::Arc;
use std::time::Duration;

use reactive_kafka::application::{
    AutoOffsetReset, ConsumerOptions, ProducerOptions, QueueBridge, SenderRecord,
};
use reactive_kafka::domain::{pipeline::Pipeline, value_objects::TopicName};
use reactive_kafka::{InMemoryLog, ProducerRecord, ReceivedRecord};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Topic to produce to and consume from
    #[arg(short, long, default_value = "demo-topic")]
    topic: String,

    /// Consumer group id
    #[arg(short, long, default_value = "demo-group")]
    group: String,

    /// Number of records to produce
    #[arg(short, long, default_value_t = 20)]
    count: u32,

    /// Partitions of the demo topic
    #[arg(short, long, default_value_t = 2)]
    partitions: u32,

    /// Optional JSON file with consumer options
    #[arg(long)]
    consumer_config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args = Args::parse();
    let topic = TopicName::new(args.topic.clone())?;

    info!(
        "Running reactive-kafka demo: {} records on {} ({} partitions)",
        args.count, topic, args.partitions
    );

    let log = InMemoryLog::new().with_default_partitions(args.partitions);
    let bridge = QueueBridge::new(Arc::new(log.clone()), ProducerOptions::default());

    let records = (0..args.count).map(|i| {
        SenderRecord::new(
            ProducerRecord::new(topic.clone(), format!("Message_{}", i))
                .with_key(format!("key-{}", i % 4)),
            i,
        )
    });
    let results = bridge.send_all(records).wait().await?;
    for result in &results {
        let ack = result.outcome.clone()?;
        info!(
            "Record {} acknowledged at {}@{}",
            result.correlation, ack.partition, ack.offset
        );
    }

    let options = match &args.consumer_config {
        Some(path) => ConsumerOptions::from_json(&std::fs::read_to_string(path)?)?,
        None => ConsumerOptions::new([topic.clone()])
            .group_id(args.group.clone())
            .auto_offset_reset(AutoOffsetReset::Earliest),
    }
    .add_assign_listener(|partitions| info!("Assigned {:?}", partitions))
    .add_revoke_listener(|partitions| info!("Revoked {:?}", partitions))
    .add_commit_listener(|event| info!("Committed {:?}", event.offsets));

    let inbound = bridge.consume(options)?;
    let all = Pipeline::new()
        .tap(|received: &ReceivedRecord| received.acknowledge())
        .collect(inbound.stream());
    let even = Pipeline::new()
        .filter(|received: &ReceivedRecord| received.offset.value() % 2 == 0)
        .map(ReceivedRecord::into_record)
        .collect(inbound.stream());

    tokio::time::sleep(Duration::from_millis(500)).await;
    inbound.close().await;

    let all = all.wait().await?;
    let even = even.wait().await?;
    info!(
        "Consumed {} records, {} at even offsets",
        all.len(),
        even.len()
    );
    for record in even {
        println!(
            "{} offset {}: {}",
            record.topic_partition(),
            record.offset,
            record.value_str()
        );
    }

    Ok(())
}
