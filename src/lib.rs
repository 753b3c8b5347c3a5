//! Streaming ingest engine for scientific instrument data
//!
//! This library subscribes to Kafka topics carrying instrument telemetry,
//! demultiplexes messages by source and writes them into one hierarchical
//! data file per write job. A job is described by a JSON template (static
//! groups, datasets and attributes plus "stream" placeholders) and a time
//! window; writer modules selected by the payload schema tag fill the
//! placeholders with data.

pub mod nexus_writer;

// Re-export main API
pub use nexus_writer::config::AppConfig;
pub use nexus_writer::filesink::{FileSink, FileSinkError, StreamPlaceholder};
pub use nexus_writer::modules::{WriteResult, WriterModule};
pub use nexus_writer::msg::Msg;
pub use nexus_writer::server::Master;
pub use nexus_writer::time::TimeWindow;
