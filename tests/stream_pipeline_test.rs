//! End-to-end runs of the partition worker / demultiplexer / file sink
//! pipeline, driven by scripted poll sources instead of a broker.

use async_trait::async_trait;
use nexus_writer::nexus_writer::filesink::{FileSink, FileSinkError};
use nexus_writer::nexus_writer::hdf::{DataBlock, HdfFile, Node};
use nexus_writer::nexus_writer::kafka::{PollSource, PollStatus};
use nexus_writer::nexus_writer::modules::{writer_modules, WriteResult, WriterModule};
use nexus_writer::nexus_writer::msg::Msg;
use nexus_writer::nexus_writer::schema::{encode_ev42, encode_f142_doubles};
use nexus_writer::nexus_writer::stream::{
    run_partition_loop, Demux, SourceEntry, SourceKey, TopicSources, WorkerState, WorkerStateCell,
};
use nexus_writer::nexus_writer::time::{StopTime, TimeWindow};
use serde_json::json;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn scratch_path(stem: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "nexus-writer-it-stream-{}-{}-{}.json",
        stem,
        std::process::id(),
        n
    ))
}

struct ScriptedSource {
    script: VecDeque<PollStatus>,
}

#[async_trait]
impl PollSource for ScriptedSource {
    async fn poll(&mut self, _timeout: Duration) -> PollStatus {
        self.script.pop_front().unwrap_or(PollStatus::TimedOut)
    }
}

struct Pipeline {
    path: PathBuf,
    sink: FileSink,
    demux: Arc<Demux>,
}

/// Builds the whole write path for one topic the way the job controller
/// does, but against an in-test template and without a broker.
async fn pipeline(
    stem: &str,
    template: serde_json::Value,
    start_ns: i64,
    stop_ns: i64,
) -> Pipeline {
    let path = scratch_path(stem);
    let (sink, placeholders) = FileSink::initialize(&path, &template).unwrap();
    let sources = Arc::new(TopicSources::default());
    for placeholder in &placeholders {
        let mut module = writer_modules()
            .instantiate(&placeholder.writer_module)
            .unwrap();
        module.parse_config(&placeholder.config).unwrap();
        let entry = Arc::new(SourceEntry::new(
            SourceKey::new(&placeholder.topic, &placeholder.source_name),
            placeholder.writer_module.clone(),
            placeholder.path.clone(),
            module,
        ));
        let init_module = entry.module();
        let group_path = placeholder.path.clone();
        sink.submit(move |file| {
            let mut module = init_module.lock().unwrap();
            module
                .init_for(file, &group_path, None)
                .map_err(|e| FileSinkError::Module(e.to_string()))
        })
        .await
        .unwrap()
        .unwrap();
        sources.insert(entry);
    }
    let window = TimeWindow::new(start_ns, 0, Arc::new(StopTime::at_ns(stop_ns)), 0);
    let demux = Arc::new(Demux::new(
        "instrument".to_string(),
        sources,
        window,
        sink.clone(),
    ));
    Pipeline { path, sink, demux }
}

async fn run_to_completion(pipeline: &Pipeline, script: Vec<PollStatus>) -> WorkerState {
    let state = Arc::new(WorkerStateCell::new());
    run_partition_loop(
        Box::new(ScriptedSource {
            script: VecDeque::from(script),
        }),
        "instrument".to_string(),
        0,
        pipeline.demux.clone(),
        0,
        Duration::from_millis(10),
        64 * 1024,
        Arc::new(AtomicBool::new(false)),
        state.clone(),
    )
    .await;
    pipeline.sink.flush().await.unwrap();
    state.get()
}

fn f142_template(source: &str) -> serde_json::Value {
    json!({
        "children": [{
            "type": "group",
            "name": "entry",
            "children": [{
                "type": "group",
                "name": "log",
                "children": [{
                    "type": "stream",
                    "stream": {
                        "topic": "instrument",
                        "source": source,
                        "writer_module": "f142",
                        "type": "double"
                    }
                }]
            }]
        }]
    })
}

fn f142_poll(source: &str, offset: i64, ts: i64, value: f64) -> PollStatus {
    PollStatus::Msg(Msg::owned(
        encode_f142_doubles(source, ts, &[value]),
        0,
        offset,
        Some(ts / 1_000_000),
    ))
}

#[tokio::test]
async fn one_source_one_partition_honours_the_window() {
    // Window [0, stop]; the wall clock must not trip the grace check, so
    // the stop sits far in the future and timestamps scale with it.
    let stop = nexus_writer::nexus_writer::time::now_ns() + 3_600_000_000_000;
    let p = pipeline("window", f142_template("motor"), 0, stop).await;
    let state = run_to_completion(
        &p,
        vec![
            f142_poll("motor", 0, 500, 1.0),
            f142_poll("motor", 1, stop, 2.0),
            f142_poll("motor", 2, stop + 1, 3.0),
        ],
    )
    .await;
    assert_eq!(state, WorkerState::Finished);
    assert_eq!(p.demux.active_sources(), 0);
    p.sink.finalize().await.unwrap();

    let file = HdfFile::open(&p.path).unwrap();
    assert_eq!(
        file.dataset("/entry/log/time").unwrap().data,
        DataBlock::UInt(vec![500, stop as u64])
    );
    assert_eq!(
        file.dataset("/entry/log/value").unwrap().data,
        DataBlock::Float(vec![1.0, 2.0])
    );
    std::fs::remove_file(&p.path).unwrap();
}

#[tokio::test]
async fn duplicate_timestamps_suppressed_for_f142_but_not_ev42() {
    let stop = nexus_writer::nexus_writer::time::now_ns() + 3_600_000_000_000;

    let p = pipeline("dedup-f142", f142_template("motor"), 0, stop).await;
    run_to_completion(
        &p,
        vec![
            f142_poll("motor", 0, 10, 1.0),
            f142_poll("motor", 1, 10, 1.0),
            f142_poll("motor", 2, 20, 2.0),
            f142_poll("motor", 3, stop + 1, 0.0),
        ],
    )
    .await;
    let file = HdfFile::open(&p.path).unwrap();
    assert_eq!(
        file.dataset("/entry/log/time").unwrap().data,
        DataBlock::UInt(vec![10, 20])
    );
    std::fs::remove_file(&p.path).unwrap();

    let ev42_template = json!({
        "children": [{
            "type": "group",
            "name": "entry",
            "children": [{
                "type": "group",
                "name": "events",
                "children": [{
                    "type": "stream",
                    "stream": {
                        "topic": "instrument",
                        "source": "detector",
                        "writer_module": "ev42"
                    }
                }]
            }]
        }]
    });
    let p = pipeline("dedup-ev42", ev42_template, 0, stop).await;
    let mut script = Vec::new();
    for (offset, ts) in [(0, 10), (1, 10), (2, 20)] {
        script.push(PollStatus::Msg(Msg::owned(
            encode_ev42("detector", ts, &[(100, 1)]),
            0,
            offset,
            None,
        )));
    }
    script.push(PollStatus::Msg(Msg::owned(
        encode_ev42("detector", stop + 1, &[]),
        0,
        3,
        None,
    )));
    run_to_completion(&p, script).await;
    let file = HdfFile::open(&p.path).unwrap();
    assert_eq!(
        file.dataset("/entry/events/event_time_zero").unwrap().data,
        DataBlock::UInt(vec![10, 10, 20])
    );
    std::fs::remove_file(&p.path).unwrap();
}

#[tokio::test]
async fn unknown_source_increments_only_its_counter() {
    let stop = nexus_writer::nexus_writer::time::now_ns() + 3_600_000_000_000;
    let p = pipeline("unknown", f142_template("motor"), 0, stop).await;
    run_to_completion(
        &p,
        vec![
            f142_poll("impostor", 0, 10, 1.0),
            f142_poll("motor", 1, stop + 1, 0.0),
        ],
    )
    .await;
    let stats = p.demux.stats();
    assert_eq!(stats.unknown_source.load(Ordering::Relaxed), 1);
    assert_eq!(stats.missing_timestamp.load(Ordering::Relaxed), 0);
    assert_eq!(stats.bad_messages.load(Ordering::Relaxed), 0);
    let entry = p.demux.sources().entries().pop().unwrap();
    assert_eq!(entry.stats().messages_written.load(Ordering::Relaxed), 0);
    assert_eq!(entry.stats().write_errors.load(Ordering::Relaxed), 0);
    std::fs::remove_file(&p.path).unwrap();
}

/// Fails on its second write, succeeds otherwise.
struct FlakyWriter {
    inner: Box<dyn WriterModule>,
    writes: u64,
}

impl WriterModule for FlakyWriter {
    fn parse_config(
        &mut self,
        config: &serde_json::Value,
    ) -> Result<(), nexus_writer::nexus_writer::modules::ModuleError> {
        self.inner.parse_config(config)
    }

    fn init_for(
        &mut self,
        file: &mut HdfFile,
        group_path: &str,
        attributes: Option<&serde_json::Value>,
    ) -> Result<(), nexus_writer::nexus_writer::modules::ModuleError> {
        self.inner.init_for(file, group_path, attributes)
    }

    fn reopen(
        &mut self,
        file: &mut HdfFile,
        group_path: &str,
    ) -> Result<(), nexus_writer::nexus_writer::modules::ModuleError> {
        self.inner.reopen(file, group_path)
    }

    fn write(&mut self, file: &mut HdfFile, msg: &Msg) -> WriteResult {
        self.writes += 1;
        if self.writes == 2 {
            return WriteResult::Error {
                message: "injected failure".to_string(),
            };
        }
        self.inner.write(file, msg)
    }
}

#[tokio::test]
async fn partial_write_failure_keeps_the_source_alive() {
    let stop = nexus_writer::nexus_writer::time::now_ns() + 3_600_000_000_000;
    let path = scratch_path("flaky");
    let template = json!({
        "children": [{
            "type": "group",
            "name": "log",
            "children": []
        }]
    });
    let (sink, _) = FileSink::initialize(&path, &template).unwrap();

    let mut inner = writer_modules().instantiate("f142").unwrap();
    inner.parse_config(&json!({"type": "double"})).unwrap();
    let entry = Arc::new(SourceEntry::new(
        SourceKey::new("instrument", "motor"),
        "f142".to_string(),
        "/log".to_string(),
        Box::new(FlakyWriter { inner, writes: 0 }),
    ));
    let init_module = entry.module();
    sink.submit(move |file| {
        let mut module = init_module.lock().unwrap();
        module
            .init_for(file, "/log", None)
            .map_err(|e| FileSinkError::Module(e.to_string()))
    })
    .await
    .unwrap()
    .unwrap();
    let sources = Arc::new(TopicSources::default());
    sources.insert(entry);
    let window = TimeWindow::new(0, 0, Arc::new(StopTime::at_ns(stop)), 0);
    let demux = Arc::new(Demux::new(
        "instrument".to_string(),
        sources,
        window,
        sink.clone(),
    ));
    let p = Pipeline { path, sink, demux };

    run_to_completion(
        &p,
        vec![
            f142_poll("motor", 0, 10, 1.0),
            f142_poll("motor", 1, 20, 2.0),
            f142_poll("motor", 2, 30, 3.0),
            f142_poll("motor", 3, stop + 1, 0.0),
        ],
    )
    .await;

    let entry = p.demux.sources().entries().pop().unwrap();
    assert_eq!(entry.stats().messages_written.load(Ordering::Relaxed), 2);
    assert_eq!(entry.stats().write_errors.load(Ordering::Relaxed), 1);
    p.sink.finalize().await.unwrap();

    let file = HdfFile::open(&p.path).unwrap();
    assert_eq!(
        file.dataset("/log/value").unwrap().data,
        DataBlock::Float(vec![1.0, 3.0])
    );
    std::fs::remove_file(&p.path).unwrap();
}

#[tokio::test]
async fn forced_stop_drains_and_finalizes_links() {
    let stop = nexus_writer::nexus_writer::time::now_ns() + 3_600_000_000_000;
    let template = json!({
        "children": [{
            "type": "group",
            "name": "entry",
            "children": [
                {
                    "type": "group",
                    "name": "log",
                    "children": [{
                        "type": "stream",
                        "stream": {
                            "topic": "instrument",
                            "source": "motor",
                            "writer_module": "f142",
                            "type": "double"
                        }
                    }]
                },
                {"type": "link", "name": "log_values", "target": "../entry/log/value"}
            ]
        }]
    });
    let p = pipeline("forced", template, 0, stop).await;

    let stop_flag = Arc::new(AtomicBool::new(false));
    let state = Arc::new(WorkerStateCell::new());
    let worker = tokio::spawn(run_partition_loop(
        Box::new(ScriptedSource {
            script: VecDeque::from(vec![f142_poll("motor", 0, 10, 1.0)]),
        }),
        "instrument".to_string(),
        0,
        p.demux.clone(),
        0,
        Duration::from_millis(10),
        64 * 1024,
        stop_flag.clone(),
        state.clone(),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop_flag.store(true, Ordering::SeqCst);
    worker.await.unwrap();
    assert_eq!(state.get(), WorkerState::Finished);

    p.sink.flush().await.unwrap();
    p.sink.finalize().await.unwrap();
    let file = HdfFile::open(&p.path).unwrap();
    // The deferred link resolves against the dataset the module created.
    match file.resolve("/entry/log_values") {
        Some(Node::Dataset(dataset)) => {
            assert_eq!(dataset.data, DataBlock::Float(vec![1.0]));
        }
        other => panic!("expected linked dataset, got {:?}", other),
    }
    std::fs::remove_file(&p.path).unwrap();
}

#[tokio::test]
async fn replaying_a_partition_yields_identical_numeric_datasets() {
    let stop = nexus_writer::nexus_writer::time::now_ns() + 3_600_000_000_000;
    let script = |_: ()| {
        vec![
            f142_poll("motor", 0, 10, 1.25),
            f142_poll("motor", 1, 20, 2.5),
            f142_poll("motor", 2, 30, -3.75),
            f142_poll("motor", 3, stop + 1, 0.0),
        ]
    };
    let mut rendered = Vec::new();
    for run in 0..2 {
        let p = pipeline(&format!("replay-{}", run), f142_template("motor"), 0, stop).await;
        run_to_completion(&p, script(())).await;
        p.sink.finalize().await.unwrap();
        let file = HdfFile::open(&p.path).unwrap();
        let value = serde_json::to_string(file.dataset("/entry/log/value").unwrap()).unwrap();
        let time = serde_json::to_string(file.dataset("/entry/log/time").unwrap()).unwrap();
        rendered.push((value, time));
        std::fs::remove_file(&p.path).unwrap();
    }
    assert_eq!(rendered[0], rendered[1]);
}
