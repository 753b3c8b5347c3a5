//! Per-partition consumer with a bounded, classified poll

use super::config::BrokerSettings;
use super::error::KafkaInterfaceError;
use crate::nexus_writer::msg::Msg;
use async_trait::async_trait;
use log::debug;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message as KafkaMessage;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;

/// Where a partition worker attaches its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// Earliest available offset; the fallback when offset-for-time fails.
    Beginning,
    /// Latest offset; used when the job start lies in the future.
    End,
    /// The broker-resolved offset for `start - start_leeway`.
    At(i64),
}

impl From<StartOffset> for Offset {
    fn from(start: StartOffset) -> Offset {
        match start {
            StartOffset::Beginning => Offset::Beginning,
            StartOffset::End => Offset::End,
            StartOffset::At(offset) => Offset::Offset(offset),
        }
    }
}

/// Classified outcome of one consumer poll.
#[derive(Debug)]
pub enum PollStatus {
    Msg(Msg),
    /// A poll that yielded a message without payload.
    Empty,
    EndOfPartition,
    TimedOut,
    /// Transient broker error; the worker re-polls.
    Error(String),
}

/// The poll surface a partition worker drives. Kept as a trait so worker
/// behaviour can be exercised with scripted sources in tests.
#[async_trait]
pub trait PollSource: Send {
    async fn poll(&mut self, timeout: Duration) -> PollStatus;
}

/// A consumer assigned to exactly one `(topic, partition)`, owned by
/// exactly one worker thread.
pub struct KafkaPartitionConsumer {
    consumer: StreamConsumer,
    partition: i32,
}

impl KafkaPartitionConsumer {
    pub fn new(
        settings: &BrokerSettings,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<KafkaPartitionConsumer, KafkaInterfaceError> {
        let group_id = settings.group_id(topic);
        let consumer: StreamConsumer = settings
            .consumer_config(&group_id)
            .create()
            .map_err(KafkaInterfaceError::from)?;
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, start.into())
            .map_err(KafkaInterfaceError::from)?;
        consumer
            .assign(&assignment)
            .map_err(KafkaInterfaceError::from)?;
        debug!(
            "Assigned consumer group \"{}\" to {}:{} at {:?}",
            group_id, topic, partition, start
        );
        Ok(KafkaPartitionConsumer {
            consumer,
            partition,
        })
    }
}

#[async_trait]
impl PollSource for KafkaPartitionConsumer {
    async fn poll(&mut self, timeout: Duration) -> PollStatus {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(Ok(message)) => match message.payload() {
                Some(payload) => {
                    let timestamp_ms = match message.timestamp() {
                        rdkafka::Timestamp::NotAvailable => None,
                        rdkafka::Timestamp::CreateTime(t)
                        | rdkafka::Timestamp::LogAppendTime(t) => Some(t),
                    };
                    PollStatus::Msg(Msg::owned(
                        payload.to_vec(),
                        self.partition,
                        message.offset(),
                        timestamp_ms,
                    ))
                }
                None => PollStatus::Empty,
            },
            Ok(Err(KafkaError::PartitionEOF(_))) => PollStatus::EndOfPartition,
            Ok(Err(e)) => PollStatus::Error(e.to_string()),
            Err(_) => PollStatus::TimedOut,
        }
    }
}
