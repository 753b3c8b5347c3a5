//! The master loop
//!
//! Polls the command topic, creates and destroys job controllers, publishes
//! the aggregate status document at the configured cadence and sweeps jobs
//! that have finished tearing down.

use super::commands::{parse_command, Command, NewCommand, StopCommand};
use super::status::StatusReport;
use crate::nexus_writer::config::AppConfig;
use crate::nexus_writer::kafka::BrokerSettings;
use crate::nexus_writer::stream::{JobConfig, StreamController};
use crate::nexus_writer::time::{ms_to_ns, now_ms};
use log::{debug, error, info, warn};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message as KafkaMessage;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum MasterError {
    Kafka(KafkaError),
    Config(String),
}

impl fmt::Display for MasterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MasterError::Kafka(err) => write!(f, "Kafka error: {}", err),
            MasterError::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl Error for MasterError {}

impl From<KafkaError> for MasterError {
    fn from(err: KafkaError) -> Self {
        MasterError::Kafka(err)
    }
}

/// What the loop should do after handling one command.
#[derive(Debug, PartialEq, Eq)]
enum LoopAction {
    Continue,
    Exit,
}

pub struct Master {
    config: AppConfig,
    settings: Arc<BrokerSettings>,
    service_id: String,
    jobs: HashMap<String, StreamController>,
    command_errors: u64,
}

impl Master {
    pub fn new(config: AppConfig) -> Master {
        let settings = Arc::new(config.broker_settings());
        let service_id = config.service_id();
        info!("Master starting as \"{}\"", service_id);
        Master {
            config,
            settings,
            service_id,
            jobs: HashMap::new(),
            command_errors: 0,
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Commands rejected or failed since startup.
    pub fn command_error_count(&self) -> u64 {
        self.command_errors
    }

    /// Runs until an exit command or a termination signal arrives, then
    /// stops every job and drains.
    pub async fn run(mut self) -> Result<(), MasterError> {
        let consumer: StreamConsumer = self
            .settings
            .consumer_config(&self.settings.group_id(&self.config.command_topic))
            .create()?;
        consumer.subscribe(&[self.config.command_topic.as_str()])?;
        info!("Listening for commands on \"{}\"", self.config.command_topic);

        let status_producer: Option<(FutureProducer, String)> =
            match &self.config.status_topic {
                Some(topic) => {
                    let producer: FutureProducer = rdkafka::ClientConfig::new()
                        .set("bootstrap.servers", &self.settings.brokers)
                        .set("message.timeout.ms", "5000")
                        .create()?;
                    info!("Publishing status to \"{}\"", topic);
                    Some((producer, topic.clone()))
                }
                None => None,
            };

        // Commands given in the configuration file run first; useful for
        // testing against a quiet command topic.
        for command in std::mem::take(&mut self.config.commands) {
            let payload = serde_json::to_vec(&command).unwrap_or_default();
            if self.handle_command(&payload).await == LoopAction::Exit {
                self.shutdown().await;
                return Ok(());
            }
        }

        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .map_err(|e| MasterError::Config(format!("cannot install SIGINT handler: {}", e)))?;
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .map_err(|e| MasterError::Config(format!("cannot install SIGTERM handler: {}", e)))?;

        let poll_timeout = Duration::from_millis(self.config.poll_timeout_ms);
        let status_interval = Duration::from_millis(self.config.status_interval_ms);
        let mut last_status = Instant::now();

        loop {
            let action = tokio::select! {
                _ = sigint.recv() => {
                    info!("SIGINT received, shutting down");
                    LoopAction::Exit
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    LoopAction::Exit
                }
                polled = tokio::time::timeout(poll_timeout, consumer.recv()) => {
                    match polled {
                        Ok(Ok(message)) => match message.payload() {
                            Some(payload) => self.handle_command(payload).await,
                            None => LoopAction::Continue,
                        },
                        Ok(Err(e)) => {
                            debug!("Command consumer poll error: {}", e);
                            LoopAction::Continue
                        }
                        Err(_) => LoopAction::Continue,
                    }
                }
            };
            if action == LoopAction::Exit {
                break;
            }

            if last_status.elapsed() >= status_interval {
                last_status = Instant::now();
                if let Some((producer, topic)) = &status_producer {
                    self.publish_status(producer, topic).await;
                }
            }

            self.jobs.retain(|job_id, job| {
                if job.is_removable() {
                    info!("Job {} is {} and gets removed", job_id, job.state().as_str());
                    false
                } else {
                    true
                }
            });
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("Stopping {} running job(s)", self.jobs.len());
        for job in self.jobs.values() {
            job.stop_now();
        }
        for (job_id, mut job) in self.jobs.drain() {
            job.join().await;
            info!("Job {} drained", job_id);
        }
    }

    async fn handle_command(&mut self, payload: &[u8]) -> LoopAction {
        let command = match parse_command(payload) {
            Ok(command) => command,
            Err(e) => {
                self.command_errors += 1;
                error!("Rejected command: {}", e);
                return LoopAction::Continue;
            }
        };
        match command {
            Command::New(new) => {
                self.handle_new(new).await;
                LoopAction::Continue
            }
            Command::Stop(stop) => {
                self.handle_stop(stop);
                LoopAction::Continue
            }
            Command::ClearAll => {
                info!("Clearing all {} job(s)", self.jobs.len());
                for job in self.jobs.values() {
                    job.stop_now();
                }
                LoopAction::Continue
            }
            Command::Exit => {
                info!("Exit command received");
                LoopAction::Exit
            }
        }
    }

    async fn handle_new(&mut self, command: NewCommand) {
        if self.jobs.contains_key(&command.job_id) {
            self.command_errors += 1;
            error!("Job id \"{}\" is already in use, ignoring", command.job_id);
            return;
        }
        let start_ms = command.start_time.unwrap_or_else(now_ms);
        let job_config = JobConfig {
            job_id: command.job_id.clone(),
            file_path: self.config.output_dir.join(&command.file_attributes.file_name),
            template: command.nexus_structure,
            start_ns: ms_to_ns(start_ms),
            stop_ns: command.stop_time.map(ms_to_ns),
            start_leeway_ns: ms_to_ns(self.config.start_leeway_ms),
            stop_leeway_ns: ms_to_ns(self.config.stop_leeway_ms),
            after_stop_grace_ns: ms_to_ns(self.config.after_stop_grace_ms),
            queue_high_water: self.config.queue_high_water,
        };
        match StreamController::start(job_config, self.settings.clone()).await {
            Ok(controller) => {
                info!(
                    "Job {} started, writing {}",
                    command.job_id,
                    controller.file_path().display()
                );
                self.jobs.insert(command.job_id, controller);
            }
            Err(e) => {
                self.command_errors += 1;
                error!("Job {} failed to start: {}", command.job_id, e);
            }
        }
    }

    fn handle_stop(&mut self, command: StopCommand) {
        match self.jobs.get(&command.job_id) {
            Some(job) => match command.stop_time {
                Some(stop_ms) => job.set_stop_time_ms(stop_ms),
                None => job.stop_now(),
            },
            None => {
                self.command_errors += 1;
                warn!("Stop command for unknown job \"{}\"", command.job_id);
            }
        }
    }

    async fn publish_status(&self, producer: &FutureProducer, topic: &str) {
        let mut report = StatusReport::new(&self.service_id);
        for job in self.jobs.values() {
            report.add_job(job);
        }
        let buffer = match serde_json::to_string(&report.to_json()) {
            Ok(buffer) => buffer,
            Err(e) => {
                error!("Could not serialise status report: {}", e);
                return;
            }
        };
        let record = FutureRecord::to(topic)
            .key(self.service_id.as_str())
            .payload(&buffer);
        if let Err((e, _)) = producer.send(record, Duration::from_secs(1)).await {
            warn!("Could not publish status: {}", e);
        }
    }
}
