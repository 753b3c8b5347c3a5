//! Kafka interface error types

use rdkafka::error::KafkaError;
use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum KafkaInterfaceError {
    /// Kafka client error
    Kafka(KafkaError),
    /// The topic is not present in the broker metadata
    TopicNotFound(String),
    /// A metadata or offset query ran out of time
    Timeout(String),
    /// Consumer construction or assignment failed
    Consumer(String),
}

impl fmt::Display for KafkaInterfaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KafkaInterfaceError::Kafka(err) => write!(f, "Kafka error: {}", err),
            KafkaInterfaceError::TopicNotFound(topic) => {
                write!(f, "topic \"{}\" not in broker metadata", topic)
            }
            KafkaInterfaceError::Timeout(what) => write!(f, "timed out: {}", what),
            KafkaInterfaceError::Consumer(msg) => write!(f, "consumer error: {}", msg),
        }
    }
}

impl Error for KafkaInterfaceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            KafkaInterfaceError::Kafka(err) => Some(err),
            _ => None,
        }
    }
}

impl From<KafkaError> for KafkaInterfaceError {
    fn from(err: KafkaError) -> Self {
        KafkaInterfaceError::Kafka(err)
    }
}
