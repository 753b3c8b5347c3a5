//! Application configuration
//!
//! Configuration comes from an optional JSON file plus command-line flags;
//! flags win. Only the command topic is required. Durations are accepted in
//! milliseconds at this boundary and converted to internal units where they
//! are used.

use crate::nexus_writer::kafka::BrokerSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "cannot read config file: {}", err),
            ConfigError::Parse(err) => write!(f, "cannot parse config file: {}", err),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Parse(err) => Some(err),
            ConfigError::Invalid(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Broker addresses, `host:port[,host:port...]`.
    pub brokers: String,
    /// Topic the master polls for commands.
    pub command_topic: String,
    /// Topic the aggregate status document is published to.
    pub status_topic: Option<String>,
    /// Identity reported in the status document; defaults to
    /// `nexus-writer--<hostname>--<pid>`.
    pub service_id: Option<String>,
    /// Directory that `file_name` from commands is resolved against.
    pub output_dir: PathBuf,
    pub status_interval_ms: u64,
    pub poll_timeout_ms: u64,
    pub metadata_timeout_ms: u64,
    pub metadata_timeout_max_ms: u64,
    pub fetch_message_max_bytes: usize,
    pub receive_message_max_bytes: usize,
    pub start_leeway_ms: i64,
    pub stop_leeway_ms: i64,
    pub after_stop_grace_ms: i64,
    /// File sink queue depth above which partition workers back off.
    pub queue_high_water: usize,
    /// Extra librdkafka properties applied to every consumer.
    pub kafka: HashMap<String, String>,
    /// Commands executed at startup, before the listener is polled.
    pub commands: Vec<serde_json::Value>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            brokers: "localhost:9092".to_string(),
            command_topic: String::new(),
            status_topic: None,
            service_id: None,
            output_dir: PathBuf::from("."),
            status_interval_ms: 2000,
            poll_timeout_ms: 100,
            metadata_timeout_ms: 500,
            metadata_timeout_max_ms: 8000,
            fetch_message_max_bytes: 10 * 1024 * 1024,
            receive_message_max_bytes: 32 * 1024 * 1024,
            start_leeway_ms: 1000,
            stop_leeway_ms: 1000,
            after_stop_grace_ms: 5000,
            queue_high_water: 64 * 1024,
            kafka: HashMap::new(),
            commands: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<AppConfig, ConfigError> {
        let data = std::fs::read(path).map_err(ConfigError::Io)?;
        serde_json::from_slice(&data).map_err(ConfigError::Parse)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_topic.is_empty() {
            return Err(ConfigError::Invalid("command_topic is required".to_string()));
        }
        if self.brokers.is_empty() {
            return Err(ConfigError::Invalid("brokers is required".to_string()));
        }
        if self.fetch_message_max_bytes < 1024 * 1024 {
            return Err(ConfigError::Invalid(
                "fetch_message_max_bytes below 1 MiB".to_string(),
            ));
        }
        Ok(())
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            brokers: self.brokers.clone(),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            metadata_timeout: Duration::from_millis(self.metadata_timeout_ms),
            metadata_timeout_max: Duration::from_millis(self.metadata_timeout_max_ms),
            fetch_message_max_bytes: self.fetch_message_max_bytes,
            receive_message_max_bytes: self.receive_message_max_bytes,
            custom: self.kafka.clone(),
        }
    }

    pub fn service_id(&self) -> String {
        self.service_id.clone().unwrap_or_else(process_id)
    }
}

/// Stable identity of this writer process.
pub fn process_id() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string());
    format!("nexus-writer--{}--{}", hostname, std::process::id())
}
