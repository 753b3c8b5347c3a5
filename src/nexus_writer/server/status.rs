//! Aggregated status reporting
//!
//! The master publishes one `stream_master_status` document per cadence
//! tick: per-job message and error counts plus a next-message ETA derived
//! from observed broker timestamps. All counts are read from the atomics
//! the runtime maintains; building a report never touches the file.

use crate::nexus_writer::stream::StreamController;
use crate::nexus_writer::time::{now_ms, ns_to_ms, STOP_TIME_NOT_SET};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatistics {
    pub schema: String,
    pub messages: u64,
    #[serde(rename = "Mbytes")]
    pub mbytes: f64,
    pub errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatistics {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub file_being_written: String,
    pub start_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_time_ms: Option<i64>,
    pub messages: u64,
    #[serde(rename = "Mbytes")]
    pub mbytes: f64,
    pub errors: u64,
    pub sources: BTreeMap<String, SourceStatistics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_message_eta_ms: Option<i64>,
}

/// The aggregate document published on the status topic.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(rename = "type")]
    pub doc_type: &'static str,
    pub service_id: String,
    pub files: BTreeMap<String, JobStatistics>,
}

impl StatusReport {
    pub fn new(service_id: &str) -> StatusReport {
        StatusReport {
            doc_type: "stream_master_status",
            service_id: service_id.to_string(),
            files: BTreeMap::new(),
        }
    }

    pub fn add_job(&mut self, controller: &StreamController) {
        self.files
            .insert(controller.job_id().to_string(), job_statistics(controller));
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}

pub fn job_statistics(controller: &StreamController) -> JobStatistics {
    let mut sources = BTreeMap::new();
    let mut messages = 0u64;
    let mut bytes = 0u64;
    let mut errors = 0u64;

    for (_, topic_sources) in controller.registry().topics() {
        for entry in topic_sources.entries() {
            let stats = entry.stats();
            let written = stats.messages_written.load(Ordering::Relaxed);
            let source_bytes = stats.bytes_written.load(Ordering::Relaxed);
            let source_errors = stats.write_errors.load(Ordering::Relaxed);
            messages += written;
            bytes += source_bytes;
            errors += source_errors;
            let last_ts = stats.last_timestamp_ns.load(Ordering::Relaxed);
            sources.insert(
                entry.key().source_name().to_string(),
                SourceStatistics {
                    schema: entry.schema_id().to_string(),
                    messages: written,
                    mbytes: source_bytes as f64 / 1e6,
                    errors: source_errors,
                    last_timestamp_ms: if last_ts == i64::MIN {
                        None
                    } else {
                        Some(ns_to_ms(last_ts))
                    },
                },
            );
        }
    }

    // Demux-level drops count as errors in the aggregate, matching the
    // "error counts" the status consumers alarm on.
    for demux in controller.demuxes() {
        let stats = demux.stats();
        errors += stats.bad_messages.load(Ordering::Relaxed)
            + stats.missing_timestamp.load(Ordering::Relaxed)
            + stats.unknown_source.load(Ordering::Relaxed);
    }

    let now = now_ms();
    let eta = controller
        .demuxes()
        .iter()
        .filter_map(|d| d.stats().next_message_eta_ms(now))
        .min();

    let stop_ns = controller.stop_time().get_ns();
    JobStatistics {
        state: controller.state().as_str().to_string(),
        error: controller.failure(),
        file_being_written: controller.file_path().display().to_string(),
        start_time_ms: ns_to_ms(controller.start_ns()),
        stop_time_ms: if stop_ns == STOP_TIME_NOT_SET {
            None
        } else {
            Some(ns_to_ms(stop_ns))
        },
        messages,
        mbytes: bytes as f64 / 1e6,
        errors,
        sources,
        next_message_eta_ms: eta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_document_has_the_expected_shape() {
        let report = StatusReport::new("nexus-writer--host--1");
        let doc = report.to_json();
        assert_eq!(doc["type"], "stream_master_status");
        assert_eq!(doc["service_id"], "nexus-writer--host--1");
        assert!(doc["files"].as_object().unwrap().is_empty());
    }
}
