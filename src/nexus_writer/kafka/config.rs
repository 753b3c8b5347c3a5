//! Broker connection settings shared by consumers and metadata clients

use rdkafka::config::ClientConfig;
use std::collections::HashMap;
use std::time::Duration;

/// Everything needed to build a consumer against the broker. One instance
/// per process, shared read-only between jobs.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub brokers: String,
    /// Bounded consumer poll timeout; workers never block longer than this.
    pub poll_timeout: Duration,
    /// Initial metadata query timeout; doubles on each retry.
    pub metadata_timeout: Duration,
    /// Cap for the doubling metadata timeout.
    pub metadata_timeout_max: Duration,
    pub fetch_message_max_bytes: usize,
    pub receive_message_max_bytes: usize,
    /// Extra librdkafka properties, applied last so they can override.
    pub custom: HashMap<String, String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        BrokerSettings {
            brokers: "localhost:9092".to_string(),
            poll_timeout: Duration::from_millis(100),
            metadata_timeout: Duration::from_millis(500),
            metadata_timeout_max: Duration::from_secs(8),
            fetch_message_max_bytes: 10 * 1024 * 1024,
            receive_message_max_bytes: 32 * 1024 * 1024,
            custom: HashMap::new(),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

impl BrokerSettings {
    /// Consumer group id for one topic's workers. Unique per process and
    /// attach time so jobs never join each other's groups.
    pub fn group_id(&self, topic: &str) -> String {
        format!(
            "filewriter--{}--{}--{}--{}",
            hostname(),
            std::process::id(),
            topic,
            crate::nexus_writer::time::now_ms()
        )
    }

    /// Base client configuration for partition consumers.
    pub fn consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest")
            .set("enable.partition.eof", "true")
            .set(
                "fetch.message.max.bytes",
                self.fetch_message_max_bytes.to_string(),
            )
            .set(
                "receive.message.max.bytes",
                self.receive_message_max_bytes.to_string(),
            );
        for (key, value) in &self.custom {
            config.set(key, value);
        }
        config
    }

    /// Minimal configuration for short-lived metadata clients.
    pub fn metadata_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", self.group_id("metadata"));
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_ids_carry_topic_and_pid() {
        let settings = BrokerSettings::default();
        let group_id = settings.group_id("chopper");
        assert!(group_id.starts_with("filewriter--"));
        assert!(group_id.contains("--chopper--"));
        assert!(group_id.contains(&format!("--{}--", std::process::id())));
    }

    #[test]
    fn custom_properties_are_applied(){
        let mut settings = BrokerSettings::default();
        settings
            .custom
            .insert("security.protocol".to_string(), "ssl".to_string());
        let config = settings.consumer_config("g");
        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("enable.partition.eof"), Some("true"));
    }
}
