//! Per-topic demultiplexer
//!
//! Routes validated messages to the source entry that owns them, applying
//! the time-window filter, the repeated-timestamp suppression and the
//! stop-time source removal. Accepted messages are handed to the writer
//! module through the file sink; the demultiplexer itself never touches the
//! file.

use super::source::{RemoveOutcome, TopicSources};
use crate::nexus_writer::filesink::FileSink;
use crate::nexus_writer::modules::WriteResult;
use crate::nexus_writer::schema::ValidatedMessage;
use crate::nexus_writer::time::{TimeWindow, WindowCheck};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Per-topic counters, shared with the partition workers feeding the topic.
#[derive(Debug, Default)]
pub struct DemuxStats {
    pub messages_received: AtomicU64,
    pub messages_submitted: AtomicU64,
    pub missing_timestamp: AtomicU64,
    pub unknown_source: AtomicU64,
    pub before_window: AtomicU64,
    pub removed_source: AtomicU64,
    pub bad_messages: AtomicU64,
    pub poll_errors: AtomicU64,
    /// Broker timestamp of the most recent message, for the status ETA.
    pub last_broker_timestamp_ms: AtomicI64,
    /// Exponentially smoothed gap between broker timestamps (ms).
    pub mean_message_gap_ms: AtomicI64,
}

impl DemuxStats {
    fn observe_broker_timestamp(&self, timestamp_ms: i64) {
        let previous = self
            .last_broker_timestamp_ms
            .swap(timestamp_ms, Ordering::Relaxed);
        if previous > 0 && timestamp_ms >= previous {
            let gap = timestamp_ms - previous;
            let mean = self.mean_message_gap_ms.load(Ordering::Relaxed);
            self.mean_message_gap_ms
                .store((mean * 7 + gap) / 8, Ordering::Relaxed);
        }
    }

    /// Estimated milliseconds until the next message, from observed broker
    /// timestamps.
    pub fn next_message_eta_ms(&self, now_ms: i64) -> Option<i64> {
        let last = self.last_broker_timestamp_ms.load(Ordering::Relaxed);
        if last <= 0 {
            return None;
        }
        let gap = self.mean_message_gap_ms.load(Ordering::Relaxed);
        Some((last + gap - now_ms).max(0))
    }
}

/// What the partition worker should do after one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The message was submitted to the file sink.
    Submitted,
    /// The message was dropped; consumption continues.
    Dropped,
    /// The message was past the window and its source has been removed; the
    /// caller should check whether the whole topic is finished.
    SourceFinished,
}

pub struct Demux {
    topic: String,
    sources: Arc<TopicSources>,
    window: TimeWindow,
    sink: FileSink,
    stats: Arc<DemuxStats>,
    warned_missing_timestamp: Mutex<HashSet<u64>>,
}

impl Demux {
    pub fn new(
        topic: String,
        sources: Arc<TopicSources>,
        window: TimeWindow,
        sink: FileSink,
    ) -> Demux {
        Demux {
            topic,
            sources,
            window,
            sink,
            stats: Arc::new(DemuxStats::default()),
            warned_missing_timestamp: Mutex::new(HashSet::new()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn stats(&self) -> &Arc<DemuxStats> {
        &self.stats
    }

    pub fn sources(&self) -> &Arc<TopicSources> {
        &self.sources
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    pub fn sink(&self) -> &FileSink {
        &self.sink
    }

    pub fn active_sources(&self) -> usize {
        self.sources.active_count()
    }

    pub fn process(&self, message: ValidatedMessage) -> ProcessOutcome {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        if let Some(broker_ts) = message.msg().broker_timestamp_ms() {
            self.stats.observe_broker_timestamp(broker_ts);
        }

        if message.timestamp_ns() == 0 {
            self.stats.missing_timestamp.fetch_add(1, Ordering::Relaxed);
            let mut warned = self
                .warned_missing_timestamp
                .lock()
                .expect("warn set poisoned");
            if warned.insert(message.source_hash()) {
                warn!(
                    "Message from topic \"{}\", source \"{}\" has no timestamp, ignoring",
                    self.topic,
                    message.source_name()
                );
            }
            return ProcessOutcome::Dropped;
        }

        let entry = match self.sources.get(message.source_hash()) {
            Some(entry) => entry,
            None => {
                self.stats.unknown_source.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Message from topic \"{}\" with unknown source \"{}\", ignoring",
                    self.topic,
                    message.source_name()
                );
                return ProcessOutcome::Dropped;
            }
        };

        if entry.is_removed() {
            self.stats.removed_source.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Message for already removed source \"{}\" on topic \"{}\", dropping",
                message.source_name(),
                self.topic
            );
            return ProcessOutcome::Dropped;
        }

        match self.window.check(message.timestamp_ns()) {
            WindowCheck::BeforeWindow => {
                self.stats.before_window.fetch_add(1, Ordering::Relaxed);
                ProcessOutcome::Dropped
            }
            WindowCheck::AfterWindow => {
                match self.sources.remove(message.source_hash()) {
                    RemoveOutcome::Removed => {
                        info!(
                            "Stop time passed for source \"{}\" on topic \"{}\", removing",
                            message.source_name(),
                            self.topic
                        );
                        ProcessOutcome::SourceFinished
                    }
                    _ => {
                        warn!(
                            "Can't remove source \"{}\" on topic \"{}\", not in the source list",
                            message.source_name(),
                            self.topic
                        );
                        ProcessOutcome::Dropped
                    }
                }
            }
            WindowCheck::InsideWindow => self.submit_write(entry, message),
        }
    }

    fn submit_write(
        &self,
        entry: Arc<super::source::SourceEntry>,
        message: ValidatedMessage,
    ) -> ProcessOutcome {
        let stats = entry.stats();
        let previous_ts = stats.last_timestamp_ns.load(Ordering::Relaxed);
        if message.timestamp_ns() == previous_ts && !entry.accepts_repeated_timestamps() {
            // Suppresses "refresh" republishes of an unchanged value.
            stats.repeated_dropped.fetch_add(1, Ordering::Relaxed);
            return ProcessOutcome::Dropped;
        }
        if previous_ts != i64::MIN && message.timestamp_ns() < previous_ts {
            stats.unordered_timestamps.fetch_add(1, Ordering::Relaxed);
        }
        stats
            .last_timestamp_ns
            .store(message.timestamp_ns(), Ordering::Relaxed);

        let module = entry.module();
        let source_stats = stats.clone();
        let source_name = message.source_name().to_string();
        let msg = message.msg().clone();
        // Fire and forget: the result is folded into the source statistics
        // on the writer thread, preserving per-partition submit order.
        let _ = self.sink.submit(move |file| {
            let mut module = module.lock().expect("writer module poisoned");
            match module.write(file, &msg) {
                WriteResult::Written {
                    bytes_written,
                    row_index,
                } => {
                    source_stats.messages_written.fetch_add(1, Ordering::Relaxed);
                    source_stats
                        .bytes_written
                        .fetch_add(bytes_written as u64, Ordering::Relaxed);
                    source_stats
                        .last_row_index
                        .store(row_index as u64, Ordering::Relaxed);
                }
                WriteResult::Error { message } => {
                    source_stats.write_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Write failed for source \"{}\": {}", source_name, message);
                }
            }
            Ok(())
        });
        self.stats.messages_submitted.fetch_add(1, Ordering::Relaxed);
        ProcessOutcome::Submitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nexus_writer::filesink::FileSink;
    use crate::nexus_writer::modules::writer_modules;
    use crate::nexus_writer::msg::Msg;
    use crate::nexus_writer::schema::{encode_ev42, encode_f142_doubles};
    use crate::nexus_writer::stream::source::{SourceEntry, SourceKey};
    use crate::nexus_writer::time::StopTime;
    use serde_json::json;
    use std::path::PathBuf;

    fn scratch_path(stem: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "nexus-writer-demux-{}-{}-{}.json",
            stem,
            std::process::id(),
            n
        ))
    }

    struct Fixture {
        path: PathBuf,
        demux: Demux,
    }

    impl Fixture {
        async fn new(stem: &str, module_id: &str, source: &str, stop_ns: i64) -> Fixture {
            let path = scratch_path(stem);
            let (sink, _) = FileSink::initialize(&path, &json!({"children": []})).unwrap();
            let group = format!("/{}", source);
            sink.submit({
                let group = group.clone();
                move |file| Ok(file.create_group(&group)?)
            })
            .await
            .unwrap()
            .unwrap();

            let mut module = writer_modules().instantiate(module_id).unwrap();
            module.parse_config(&json!({"type": "double"})).unwrap();
            let entry = Arc::new(SourceEntry::new(
                SourceKey::new("topic", source),
                module_id.to_string(),
                group.clone(),
                module,
            ));
            let init_module = entry.module();
            sink.submit(move |file| {
                let mut module = init_module.lock().unwrap();
                module
                    .init_for(file, &group, None)
                    .map_err(|e| crate::nexus_writer::filesink::FileSinkError::Module(e.to_string()))
            })
            .await
            .unwrap()
            .unwrap();

            let sources = Arc::new(TopicSources::default());
            sources.insert(entry);
            let window =
                TimeWindow::new(0, 0, Arc::new(StopTime::at_ns(stop_ns)), 0);
            let demux = Demux::new("topic".to_string(), sources, window, sink);
            Fixture { path, demux }
        }

        async fn finish(self) {
            self.demux.sink().flush().await.unwrap();
            std::fs::remove_file(&self.path).unwrap();
        }
    }

    fn f142_message(source: &str, ts: i64, value: f64) -> ValidatedMessage {
        ValidatedMessage::decode(Msg::owned(
            encode_f142_doubles(source, ts, &[value]),
            0,
            0,
            Some(1_000),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn window_boundaries_keep_and_drop() {
        let fixture = Fixture::new("window", "f142", "s", 1000).await;
        // start - leeway == 0: equal is kept, one below is dropped.
        assert_eq!(
            fixture.demux.process(f142_message("s", 500, 1.0)),
            ProcessOutcome::Submitted
        );
        assert_eq!(
            fixture.demux.process(f142_message("s", 1000, 2.0)),
            ProcessOutcome::Submitted
        );
        assert_eq!(
            fixture.demux.process(f142_message("s", 1001, 3.0)),
            ProcessOutcome::SourceFinished
        );
        assert_eq!(fixture.demux.active_sources(), 0);
        fixture.finish().await;
    }

    #[tokio::test]
    async fn pre_window_messages_are_dropped_silently() {
        let fixture = Fixture::new("prewindow", "f142", "s", 1000).await;
        let window = TimeWindow::new(
            100,
            10,
            Arc::new(StopTime::at_ns(1000)),
            0,
        );
        let demux = Demux::new(
            "topic".to_string(),
            fixture.demux.sources().clone(),
            window,
            fixture.demux.sink().clone(),
        );
        assert_eq!(demux.process(f142_message("s", 89, 1.0)), ProcessOutcome::Dropped);
        assert_eq!(demux.stats().before_window.load(Ordering::Relaxed), 1);
        assert_eq!(demux.process(f142_message("s", 90, 1.0)), ProcessOutcome::Submitted);
        fixture.finish().await;
    }

    #[tokio::test]
    async fn unknown_source_only_bumps_its_counter() {
        let fixture = Fixture::new("unknown", "f142", "s", 1000).await;
        assert_eq!(
            fixture.demux.process(f142_message("nobody", 10, 1.0)),
            ProcessOutcome::Dropped
        );
        let stats = fixture.demux.stats();
        assert_eq!(stats.unknown_source.load(Ordering::Relaxed), 1);
        assert_eq!(stats.missing_timestamp.load(Ordering::Relaxed), 0);
        assert_eq!(stats.messages_submitted.load(Ordering::Relaxed), 0);
        fixture.finish().await;
    }

    #[tokio::test]
    async fn missing_timestamp_is_counted() {
        let fixture = Fixture::new("nots", "f142", "s", 1000).await;
        assert_eq!(
            fixture.demux.process(f142_message("s", 0, 1.0)),
            ProcessOutcome::Dropped
        );
        assert_eq!(
            fixture.demux.stats().missing_timestamp.load(Ordering::Relaxed),
            1
        );
        fixture.finish().await;
    }

    #[tokio::test]
    async fn repeated_timestamps_are_suppressed_for_log_data() {
        let fixture = Fixture::new("dedup", "f142", "s", 1000).await;
        for (ts, value) in [(10, 1.0), (10, 1.0), (20, 2.0)] {
            fixture.demux.process(f142_message("s", ts, value));
        }
        fixture.demux.sink().flush().await.unwrap();
        let entry = fixture.demux.sources().entries().pop().unwrap();
        assert_eq!(entry.stats().messages_written.load(Ordering::Relaxed), 2);
        assert_eq!(entry.stats().repeated_dropped.load(Ordering::Relaxed), 1);
        fixture.finish().await;
    }

    #[tokio::test]
    async fn event_streams_opt_out_of_dedup() {
        let fixture = Fixture::new("ev42", "ev42", "det", 1000).await;
        for ts in [10, 10, 20] {
            let message = ValidatedMessage::decode(Msg::owned(
                encode_ev42("det", ts, &[(1, 1)]),
                0,
                0,
                None,
            ))
            .unwrap();
            assert_eq!(fixture.demux.process(message), ProcessOutcome::Submitted);
        }
        fixture.demux.sink().flush().await.unwrap();
        let entry = fixture.demux.sources().entries().pop().unwrap();
        assert_eq!(entry.stats().messages_written.load(Ordering::Relaxed), 3);
        fixture.finish().await;
    }

    #[tokio::test]
    async fn messages_for_removed_sources_are_dropped_with_warning() {
        let fixture = Fixture::new("removed", "f142", "s", 1000).await;
        assert_eq!(
            fixture.demux.process(f142_message("s", 1001, 1.0)),
            ProcessOutcome::SourceFinished
        );
        assert_eq!(
            fixture.demux.process(f142_message("s", 500, 1.0)),
            ProcessOutcome::Dropped
        );
        assert_eq!(fixture.demux.stats().removed_source.load(Ordering::Relaxed), 1);
        fixture.finish().await;
    }
}
