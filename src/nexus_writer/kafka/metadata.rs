//! Metadata and offset-for-time queries
//!
//! Each query runs on a short-lived client of its own, on the blocking
//! thread pool, so it never interleaves with a partition worker's consumer.
//! Retry policy (doubling timeout up to a cap) belongs to the topic
//! coordinator; these calls make exactly one bounded attempt.

use super::config::BrokerSettings;
use super::consumer::StartOffset;
use super::error::KafkaInterfaceError;
use log::debug;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;

/// The partition ids of a topic. Errors if the topic is unknown to the
/// broker or the query times out.
pub async fn partitions_for_topic(
    settings: &BrokerSettings,
    topic: &str,
    timeout: Duration,
) -> Result<Vec<i32>, KafkaInterfaceError> {
    let config = settings.metadata_config();
    let topic = topic.to_string();
    tokio::task::spawn_blocking(move || {
        let consumer: BaseConsumer = config.create()?;
        let metadata = consumer.fetch_metadata(Some(&topic), timeout)?;
        let topic_metadata = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .ok_or_else(|| KafkaInterfaceError::TopicNotFound(topic.clone()))?;
        if topic_metadata.partitions().is_empty() {
            return Err(KafkaInterfaceError::TopicNotFound(topic.clone()));
        }
        let partitions: Vec<i32> = topic_metadata
            .partitions()
            .iter()
            .map(|p| p.id())
            .collect();
        debug!("Topic \"{}\" has partitions {:?}", topic, partitions);
        Ok(partitions)
    })
    .await
    .map_err(|e| KafkaInterfaceError::Consumer(format!("metadata task failed: {}", e)))?
}

/// The broker offset at or after `time_ms` for each partition. A partition
/// for which the broker has no offset (or the lookup fails) falls back to
/// the earliest offset.
pub async fn offsets_for_time(
    settings: &BrokerSettings,
    topic: &str,
    partitions: &[i32],
    time_ms: i64,
    timeout: Duration,
) -> Result<Vec<(i32, StartOffset)>, KafkaInterfaceError> {
    let config = settings.metadata_config();
    let topic = topic.to_string();
    let partitions = partitions.to_vec();
    tokio::task::spawn_blocking(move || {
        let consumer: BaseConsumer = config.create()?;
        let mut query = TopicPartitionList::new();
        for partition in &partitions {
            query.add_partition_offset(&topic, *partition, Offset::Offset(time_ms))?;
        }
        let resolved = consumer.offsets_for_times(query, timeout)?;
        let mut out = Vec::with_capacity(partitions.len());
        for element in resolved.elements_for_topic(&topic) {
            let start = match element.offset() {
                Offset::Offset(offset) => StartOffset::At(offset),
                _ => StartOffset::Beginning,
            };
            out.push((element.partition(), start));
        }
        // Partitions the broker left out of the answer start from earliest.
        for partition in &partitions {
            if !out.iter().any(|(p, _)| p == partition) {
                out.push((*partition, StartOffset::Beginning));
            }
        }
        debug!("Offsets for \"{}\" at {} ms: {:?}", topic, time_ms, out);
        Ok(out)
    })
    .await
    .map_err(|e| KafkaInterfaceError::Consumer(format!("offset task failed: {}", e)))?
}
