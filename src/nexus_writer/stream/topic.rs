//! Topic coordinator
//!
//! Two-phase start: fetch the partition metadata (retrying with a doubling
//! timeout), resolve the start offsets, then spawn one partition worker per
//! partition. The whole start runs in its own task so the job controller is
//! never blocked on a slow broker; it polls the shared `done` flag instead.

use super::demux::Demux;
use super::partition::{spawn_partition_worker, PartitionHandle};
use crate::nexus_writer::kafka::{offsets_for_time, partitions_for_topic, BrokerSettings, StartOffset};
use crate::nexus_writer::time::{now_ms, ns_to_ms};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

struct Shared {
    done: AtomicBool,
    stop_requested: AtomicBool,
    workers: Mutex<Vec<PartitionHandle>>,
}

pub struct TopicCoordinator {
    topic: String,
    shared: Arc<Shared>,
    join: JoinHandle<()>,
}

impl TopicCoordinator {
    /// Starts consuming one topic. Returns immediately; partition discovery
    /// and worker spawning happen inside the coordinator's task.
    pub fn spawn(
        settings: Arc<BrokerSettings>,
        demux: Arc<Demux>,
        after_stop_grace_ns: i64,
        queue_high_water: usize,
    ) -> TopicCoordinator {
        let topic = demux.topic().to_string();
        let shared = Arc::new(Shared {
            done: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });
        let task_shared = shared.clone();
        let task_topic = topic.clone();
        let join = tokio::spawn(async move {
            run_coordinator(
                settings,
                task_topic,
                demux,
                after_stop_grace_ns,
                queue_high_water,
                task_shared,
            )
            .await;
        });
        TopicCoordinator {
            topic,
            shared,
            join,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// True once every partition worker has reached a terminal state (or
    /// the coordinator aborted before spawning any).
    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::SeqCst)
    }

    /// Requests a cooperative stop of all partition workers.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        for worker in self.shared.workers.lock().expect("worker list poisoned").iter() {
            worker.request_stop();
        }
    }

    /// Waits for the coordinator task (and thereby its workers) to finish.
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

async fn run_coordinator(
    settings: Arc<BrokerSettings>,
    topic: String,
    demux: Arc<Demux>,
    after_stop_grace_ns: i64,
    queue_high_water: usize,
    shared: Arc<Shared>,
) {
    // Phase 1: partition metadata with doubling timeout.
    let mut timeout = settings.metadata_timeout;
    let partitions = loop {
        if shared.stop_requested.load(Ordering::SeqCst) {
            shared.done.store(true, Ordering::SeqCst);
            return;
        }
        match partitions_for_topic(&settings, &topic, timeout).await {
            Ok(partitions) => break partitions,
            Err(e) => {
                warn!(
                    "Metadata for topic \"{}\" not available ({}), retrying in {:?}",
                    topic, e, timeout
                );
                tokio::time::sleep(timeout).await;
                timeout = (timeout * 2).min(settings.metadata_timeout_max);
            }
        }
    };

    // Phase 2: start offsets. A start time in the past asks the broker for
    // the offset at `start - start_leeway`; a future start attaches at the
    // latest offset. Offset errors fall back to the earliest offset.
    let start_from_ms = ns_to_ms(demux.window().earliest_ns());
    let offsets = if start_from_ms < now_ms() {
        match offsets_for_time(
            &settings,
            &topic,
            &partitions,
            start_from_ms,
            settings.metadata_timeout_max,
        )
        .await
        {
            Ok(offsets) => offsets,
            Err(e) => {
                warn!(
                    "Offset-for-time on topic \"{}\" failed ({}), falling back to earliest",
                    topic, e
                );
                partitions
                    .iter()
                    .map(|p| (*p, StartOffset::Beginning))
                    .collect()
            }
        }
    } else {
        partitions.iter().map(|p| (*p, StartOffset::End)).collect()
    };

    info!(
        "Starting {} partition worker(s) for topic \"{}\"",
        offsets.len(),
        topic
    );
    {
        let mut workers = shared.workers.lock().expect("worker list poisoned");
        for (partition, start) in offsets {
            workers.push(spawn_partition_worker(
                settings.clone(),
                topic.clone(),
                partition,
                start,
                demux.clone(),
                after_stop_grace_ns,
                queue_high_water,
            ));
        }
        if shared.stop_requested.load(Ordering::SeqCst) {
            for worker in workers.iter() {
                worker.request_stop();
            }
        }
    }

    // Completion: reap workers as they reach a terminal state.
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let workers = shared.workers.lock().expect("worker list poisoned");
        if workers.iter().all(|w| w.is_terminal()) {
            break;
        }
        if shared.stop_requested.load(Ordering::SeqCst) {
            for worker in workers.iter() {
                worker.request_stop();
            }
        }
    }
    shared.done.store(true, Ordering::SeqCst);
    info!("Topic \"{}\" is done", topic);
}
