//! Thin wrapper around the Kafka client
//!
//! One consumer per `(topic, partition)`, owned by exactly one partition
//! worker; metadata and offset-for-time queries use short-lived clients of
//! their own so they never interleave with a worker's consumer.

mod config;
mod consumer;
mod error;
mod metadata;

pub use config::BrokerSettings;
pub use consumer::{KafkaPartitionConsumer, PollSource, PollStatus, StartOffset};
pub use error::KafkaInterfaceError;
pub use metadata::{offsets_for_time, partitions_for_topic};
