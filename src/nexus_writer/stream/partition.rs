//! Partition workers
//!
//! One worker per `(topic, partition)`, owning its broker consumer. The
//! worker applies the start/stop filter through the demultiplexer and
//! retires when every source on its topic has been removed or the wall
//! clock has passed `stop + after_stop_grace`. Errors never propagate out
//! of the worker; they are counted and the worker re-polls.

use super::demux::{Demux, ProcessOutcome};
use crate::nexus_writer::kafka::{
    BrokerSettings, KafkaPartitionConsumer, PollSource, PollStatus, StartOffset,
};
use crate::nexus_writer::schema::ValidatedMessage;
use crate::nexus_writer::time::now_ns;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Worker life cycle. `Error` is terminal like `Finished`; the coordinator
/// reaps both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Initializing = 0,
    Connecting = 1,
    Consuming = 2,
    Stopping = 3,
    Finished = 4,
    Error = 5,
}

impl WorkerState {
    fn from_u8(value: u8) -> WorkerState {
        match value {
            0 => WorkerState::Initializing,
            1 => WorkerState::Connecting,
            2 => WorkerState::Consuming,
            3 => WorkerState::Stopping,
            4 => WorkerState::Finished,
            _ => WorkerState::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Finished | WorkerState::Error)
    }
}

#[derive(Debug)]
pub struct WorkerStateCell(AtomicU8);

impl WorkerStateCell {
    pub fn new() -> WorkerStateCell {
        WorkerStateCell(AtomicU8::new(WorkerState::Initializing as u8))
    }

    pub fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    pub fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::SeqCst))
    }
}

impl Default for WorkerStateCell {
    fn default() -> Self {
        WorkerStateCell::new()
    }
}

/// Handle held by the topic coordinator.
pub struct PartitionHandle {
    pub topic: String,
    pub partition: i32,
    state: Arc<WorkerStateCell>,
    stop: Arc<AtomicBool>,
    pub join: JoinHandle<()>,
}

impl PartitionHandle {
    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.get().is_terminal()
    }

    /// Cooperative stop; the worker checks the flag at each poll boundary.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Builds the consumer and runs the poll loop to completion.
pub fn spawn_partition_worker(
    settings: Arc<BrokerSettings>,
    topic: String,
    partition: i32,
    start: StartOffset,
    demux: Arc<Demux>,
    after_stop_grace_ns: i64,
    queue_high_water: usize,
) -> PartitionHandle {
    let state = Arc::new(WorkerStateCell::new());
    let stop = Arc::new(AtomicBool::new(false));
    let task_state = state.clone();
    let task_stop = stop.clone();
    let task_topic = topic.clone();
    let join = tokio::spawn(async move {
        task_state.set(WorkerState::Connecting);
        let consumer =
            match KafkaPartitionConsumer::new(&settings, &task_topic, partition, start) {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!(
                        "Could not create consumer for {}:{}: {}",
                        task_topic, partition, e
                    );
                    task_state.set(WorkerState::Error);
                    return;
                }
            };
        run_partition_loop(
            Box::new(consumer),
            task_topic,
            partition,
            demux,
            after_stop_grace_ns,
            settings.poll_timeout,
            queue_high_water,
            task_stop,
            task_state,
        )
        .await;
    });
    PartitionHandle {
        topic,
        partition,
        state,
        stop,
        join,
    }
}

/// The consume loop, driven through [`PollSource`] so tests can feed it
/// scripted poll results.
#[allow(clippy::too_many_arguments)]
pub async fn run_partition_loop(
    mut source: Box<dyn PollSource>,
    topic: String,
    partition: i32,
    demux: Arc<Demux>,
    after_stop_grace_ns: i64,
    poll_timeout: Duration,
    queue_high_water: usize,
    stop: Arc<AtomicBool>,
    state: Arc<WorkerStateCell>,
) {
    state.set(WorkerState::Consuming);
    let mut last_offset: i64 = -1;
    let mut warned_bad_message = false;

    loop {
        if stop.load(Ordering::SeqCst) {
            debug!("Stop requested for {}:{}", topic, partition);
            break;
        }
        if demux.window().stop_elapsed(now_ns(), after_stop_grace_ns) {
            info!(
                "Stop time plus grace period passed for {}:{}, stopping",
                topic, partition
            );
            break;
        }
        if demux.active_sources() == 0 {
            info!("All sources on \"{}\" are done, stopping {}:{}", topic, topic, partition);
            break;
        }
        if demux.sink().queue_depth() > queue_high_water {
            // Let the writer thread catch up before fetching more.
            tokio::time::sleep(poll_timeout).await;
            continue;
        }

        match source.poll(poll_timeout).await {
            PollStatus::Msg(msg) => {
                if msg.offset() <= last_offset {
                    warn!(
                        "Offset went backwards on {}:{} ({} after {})",
                        topic,
                        partition,
                        msg.offset(),
                        last_offset
                    );
                }
                last_offset = msg.offset();
                match ValidatedMessage::decode(msg) {
                    Ok(message) => {
                        if demux.process(message) == ProcessOutcome::SourceFinished
                            && demux.active_sources() == 0
                        {
                            info!(
                                "Last source on \"{}\" finished, stopping {}:{}",
                                topic, topic, partition
                            );
                            break;
                        }
                    }
                    Err(e) => {
                        demux.stats().bad_messages.fetch_add(1, Ordering::Relaxed);
                        if !warned_bad_message {
                            warned_bad_message = true;
                            warn!(
                                "Undecodable message on {}:{} at offset {}: {}",
                                topic, partition, last_offset, e
                            );
                        }
                    }
                }
            }
            PollStatus::Empty | PollStatus::EndOfPartition | PollStatus::TimedOut => {
                // Idle polls only re-check the stop conditions above.
            }
            PollStatus::Error(e) => {
                demux.stats().poll_errors.fetch_add(1, Ordering::Relaxed);
                debug!("Transient poll error on {}:{}: {}", topic, partition, e);
            }
        }
    }

    state.set(WorkerState::Stopping);
    // One final drain so a message already fetched is not lost.
    if let PollStatus::Msg(msg) = source.poll(poll_timeout).await {
        if let Ok(message) = ValidatedMessage::decode(msg) {
            demux.process(message);
        }
    }
    drop(source);
    state.set(WorkerState::Finished);
    debug!("Partition worker {}:{} finished", topic, partition);
}
