//! Job controller
//!
//! Owns one write job from the `new` command to teardown: the file sink,
//! the source registry and one topic coordinator per topic. Worker errors
//! never fail a job; only a failed file finalize does.

use super::demux::Demux;
use super::source::{SourceEntry, SourceKey, SourceRegistry};
use super::topic::TopicCoordinator;
use crate::nexus_writer::filesink::{FileSink, FileSinkError};
use crate::nexus_writer::kafka::BrokerSettings;
use crate::nexus_writer::modules::{writer_modules, ModuleError};
use crate::nexus_writer::time::{ms_to_ns, now_ns, StopTime, TimeWindow};
use log::{error, info, warn};
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum JobError {
    Sink(FileSinkError),
    UnknownWriterModule { module: String, source: String },
    Module { source: String, error: ModuleError },
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Sink(err) => write!(f, "file sink error: {}", err),
            JobError::UnknownWriterModule { module, source } => write!(
                f,
                "no writer module \"{}\" registered (stream source \"{}\")",
                module, source
            ),
            JobError::Module { source, error } => {
                write!(f, "writer module for source \"{}\" failed: {}", source, error)
            }
        }
    }
}

impl Error for JobError {}

impl From<FileSinkError> for JobError {
    fn from(err: FileSinkError) -> Self {
        JobError::Sink(err)
    }
}

/// Job life cycle as visible in the status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Writing = 0,
    Finishing = 1,
    Done = 2,
    Failed = 3,
}

impl JobState {
    fn from_u8(value: u8) -> JobState {
        match value {
            0 => JobState::Writing,
            1 => JobState::Finishing,
            2 => JobState::Done,
            _ => JobState::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Writing => "writing",
            JobState::Finishing => "finishing",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }
}

/// Everything a `new` command provides, converted to internal units.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub job_id: String,
    pub file_path: PathBuf,
    pub template: Value,
    pub start_ns: i64,
    pub stop_ns: Option<i64>,
    pub start_leeway_ns: i64,
    pub stop_leeway_ns: i64,
    pub after_stop_grace_ns: i64,
    pub queue_high_water: usize,
}

pub struct StreamController {
    job_id: String,
    file_path: PathBuf,
    start_ns: i64,
    stop_time: Arc<StopTime>,
    force_stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    failure: Arc<Mutex<Option<String>>>,
    registry: Arc<SourceRegistry>,
    demuxes: Vec<Arc<Demux>>,
    supervisor: Option<JoinHandle<()>>,
}

impl StreamController {
    /// Creates the file, materialises the template, instantiates a writer
    /// module per stream placeholder and spawns one topic coordinator per
    /// topic. Any failure in here is fatal to the job.
    pub async fn start(
        config: JobConfig,
        settings: Arc<BrokerSettings>,
    ) -> Result<StreamController, JobError> {
        let (sink, placeholders) = FileSink::initialize(&config.file_path, &config.template)?;

        let stop_time = Arc::new(match config.stop_ns {
            Some(ns) => StopTime::at_ns(ns),
            None => StopTime::unset(),
        });
        let window = TimeWindow::new(
            config.start_ns,
            config.start_leeway_ns,
            stop_time.clone(),
            config.stop_leeway_ns,
        );

        let mut registry = SourceRegistry::new();
        for placeholder in &placeholders {
            let mut module = writer_modules()
                .instantiate(&placeholder.writer_module)
                .ok_or_else(|| JobError::UnknownWriterModule {
                    module: placeholder.writer_module.clone(),
                    source: placeholder.source_name.clone(),
                })?;
            module
                .parse_config(&placeholder.config)
                .map_err(|error| JobError::Module {
                    source: placeholder.source_name.clone(),
                    error,
                })?;

            let entry = Arc::new(SourceEntry::new(
                SourceKey::new(&placeholder.topic, &placeholder.source_name),
                placeholder.writer_module.clone(),
                placeholder.path.clone(),
                module,
            ));

            let init_module = entry.module();
            let group_path = placeholder.path.clone();
            let attributes = placeholder.attributes.clone();
            sink.submit(move |file| {
                let mut module = init_module.lock().expect("writer module poisoned");
                module
                    .init_for(file, &group_path, attributes.as_ref())
                    .map_err(|e| FileSinkError::Module(e.to_string()))
            })
            .await
            .map_err(|_| JobError::Sink(FileSinkError::Closed))?
            .map_err(|e| JobError::Module {
                source: placeholder.source_name.clone(),
                error: ModuleError::Init(e.to_string()),
            })?;

            info!(
                "Job {}: registered source \"{}\" ({}) on topic \"{}\" at {}",
                config.job_id,
                placeholder.source_name,
                placeholder.writer_module,
                placeholder.topic,
                placeholder.path
            );
            registry.insert(entry);
        }

        // One demultiplexer and one coordinator per topic that actually has
        // sources; a topic with none gets no coordinator.
        let registry = Arc::new(registry);
        let mut demuxes = Vec::new();
        let mut coordinators = Vec::new();
        for topic in registry.topic_names() {
            let sources = registry.topic(&topic).expect("topic vanished from registry");
            let demux = Arc::new(Demux::new(
                topic.clone(),
                sources,
                window.clone(),
                sink.clone(),
            ));
            demuxes.push(demux.clone());
            coordinators.push(TopicCoordinator::spawn(
                settings.clone(),
                demux,
                config.after_stop_grace_ns,
                config.queue_high_water,
            ));
        }

        let state = Arc::new(AtomicU8::new(JobState::Writing as u8));
        let failure = Arc::new(Mutex::new(None));
        let force_stop = Arc::new(AtomicBool::new(false));

        let supervisor = tokio::spawn(supervise(
            config.job_id.clone(),
            sink,
            coordinators,
            registry.clone(),
            window,
            config.after_stop_grace_ns,
            force_stop.clone(),
            state.clone(),
            failure.clone(),
        ));

        Ok(StreamController {
            job_id: config.job_id,
            file_path: config.file_path,
            start_ns: config.start_ns,
            stop_time,
            force_stop,
            state,
            failure,
            registry,
            demuxes,
            supervisor: Some(supervisor),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn file_path(&self) -> &PathBuf {
        &self.file_path
    }

    pub fn start_ns(&self) -> i64 {
        self.start_ns
    }

    pub fn stop_time(&self) -> &Arc<StopTime> {
        &self.stop_time
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().expect("failure slot poisoned").clone()
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn demuxes(&self) -> &[Arc<Demux>] {
        &self.demuxes
    }

    /// Moves the stop time; partitions drain once their messages pass it.
    pub fn set_stop_time_ms(&self, stop_ms: i64) {
        info!("Job {}: stop time set to {} ms", self.job_id, stop_ms);
        self.stop_time.set_ns(ms_to_ns(stop_ms));
    }

    /// Forced stop: like the stop time passing, but immediate, without
    /// waiting out the grace period.
    pub fn stop_now(&self) {
        info!("Job {}: forced stop", self.job_id);
        self.stop_time.set_ns(now_ns());
        self.force_stop.store(true, Ordering::SeqCst);
    }

    /// True once the job has torn down (cleanly or not); the master sweeps
    /// removable jobs out of its table.
    pub fn is_removable(&self) -> bool {
        matches!(self.state(), JobState::Done | JobState::Failed)
    }

    /// Waits for the supervisor (teardown included) to finish.
    pub async fn join(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.await;
        }
    }
}

/// Watches the coordinators and drives teardown in order: stop coordinators,
/// join workers, close modules, drain the sink, finalize the file.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    job_id: String,
    sink: FileSink,
    coordinators: Vec<TopicCoordinator>,
    registry: Arc<SourceRegistry>,
    window: TimeWindow,
    after_stop_grace_ns: i64,
    force_stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    failure: Arc<Mutex<Option<String>>>,
) {
    loop {
        if coordinators.iter().all(|c| c.is_done()) {
            info!("Job {}: all topics done", job_id);
            break;
        }
        if force_stop.load(Ordering::SeqCst) {
            info!("Job {}: stopping all topics now", job_id);
            break;
        }
        if window.stop_elapsed(now_ns(), after_stop_grace_ns) {
            info!("Job {}: stop time plus grace elapsed, stopping all topics", job_id);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    state.store(JobState::Finishing as u8, Ordering::SeqCst);
    for coordinator in &coordinators {
        coordinator.stop();
    }
    for coordinator in coordinators {
        coordinator.join().await;
    }

    // Workers are gone; modules flush and close through the sink queue so
    // the single-writer rule holds to the very end.
    for (_, sources) in registry.topics() {
        for entry in sources.entries() {
            let module = entry.module();
            let source = entry.key().source_name().to_string();
            let done = sink.submit(move |file| {
                let mut module = module.lock().expect("writer module poisoned");
                module
                    .close(file)
                    .map_err(|e| FileSinkError::Module(e.to_string()))
            });
            if let Ok(Err(e)) = done.await {
                warn!("Job {}: closing module for \"{}\" failed: {}", job_id, source, e);
            }
        }
    }

    if let Err(e) = sink.flush().await {
        warn!("Job {}: flush before finalize failed: {}", job_id, e);
    }
    match sink.finalize().await {
        Ok(()) => {
            info!("Job {}: file finalized", job_id);
            state.store(JobState::Done as u8, Ordering::SeqCst);
        }
        Err(e) => {
            error!("Job {}: finalize failed: {}", job_id, e);
            *failure.lock().expect("failure slot poisoned") = Some(e.to_string());
            state.store(JobState::Failed as u8, Ordering::SeqCst);
        }
    }
}
