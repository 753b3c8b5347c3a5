//! The streaming runtime for one write job
//!
//! Control flows downwards: the job controller owns one topic coordinator
//! per topic, each coordinator owns one partition worker per partition, and
//! each worker owns one broker consumer. Data flows the other way: worker
//! (decode, timestamp check) -> demultiplexer (source lookup) -> writer
//! module (append through the file sink).

mod controller;
mod demux;
mod partition;
mod source;
mod topic;

pub use controller::{JobConfig, JobError, JobState, StreamController};
pub use demux::{Demux, DemuxStats, ProcessOutcome};
pub use partition::{
    run_partition_loop, spawn_partition_worker, PartitionHandle, WorkerState, WorkerStateCell,
};
pub use source::{
    RemoveOutcome, SourceEntry, SourceKey, SourceRegistry, SourceStats, TopicSources,
};
pub use topic::TopicCoordinator;
