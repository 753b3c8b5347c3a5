//! Writer module for `ev42` neutron event data.
//!
//! Datasets created under the stream's group, all `[unlimited]`:
//! - `event_time_offset`   uint32, time of flight per event
//! - `event_id`            uint32, detector id per event
//! - `event_time_zero`     uint64, pulse time per message
//! - `event_index`         uint32, index of the first event of each pulse
//! - `cue_index` / `cue_timestamp_zero`  periodic seek marks
//!
//! Event streams legitimately repeat pulse timestamps, so this module opts
//! out of the demultiplexer's repeated-timestamp suppression.

use super::{ModuleError, WriteResult, WriterModule};
use crate::nexus_writer::hdf::{DType, DataBlock, HdfFile};
use crate::nexus_writer::msg::Msg;
use crate::nexus_writer::schema::Envelope;
use serde_json::Value;

pub struct Ev42Writer {
    group_path: String,
    /// A cue row is written whenever this many bytes have gone into the
    /// event datasets since the previous cue.
    index_every_bytes: u64,
    bytes_since_cue: u64,
}

impl Default for Ev42Writer {
    fn default() -> Self {
        Ev42Writer {
            group_path: String::new(),
            index_every_bytes: u64::MAX,
            bytes_since_cue: 0,
        }
    }
}

struct EventBatch {
    pulse_time_ns: i64,
    time_of_flight: Vec<u32>,
    detector_id: Vec<u32>,
}

fn decode_events(payload: &[u8]) -> Result<EventBatch, String> {
    let envelope = Envelope::parse(payload).map_err(|e| e.to_string())?;
    let body = envelope.body;
    if body.len() < 4 {
        return Err(format!("ev42 body too short: {} bytes", body.len()));
    }
    let count = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let events = &body[4..];
    if events.len() < count * 8 {
        return Err(format!(
            "ev42 body truncated: {} events in {} bytes",
            count,
            events.len()
        ));
    }
    let mut time_of_flight = Vec::with_capacity(count);
    let mut detector_id = Vec::with_capacity(count);
    for i in 0..count {
        let at = i * 8;
        time_of_flight.push(u32::from_le_bytes([
            events[at],
            events[at + 1],
            events[at + 2],
            events[at + 3],
        ]));
        detector_id.push(u32::from_le_bytes([
            events[at + 4],
            events[at + 5],
            events[at + 6],
            events[at + 7],
        ]));
    }
    Ok(EventBatch {
        pulse_time_ns: envelope.timestamp_ns,
        time_of_flight,
        detector_id,
    })
}

impl Ev42Writer {
    fn dataset_path(&self, name: &str) -> String {
        format!("{}/{}", self.group_path, name)
    }
}

impl WriterModule for Ev42Writer {
    fn parse_config(&mut self, config: &Value) -> Result<(), ModuleError> {
        if let Some(kb) = config.get("index_every_kb").and_then(Value::as_u64) {
            self.index_every_bytes = kb * 1024;
        }
        if let Some(mb) = config.get("index_every_mb").and_then(Value::as_u64) {
            self.index_every_bytes = mb * 1024 * 1024;
        }
        Ok(())
    }

    fn init_for(
        &mut self,
        file: &mut HdfFile,
        group_path: &str,
        attributes: Option<&Value>,
    ) -> Result<(), ModuleError> {
        self.group_path = group_path.to_string();
        for (name, dtype) in [
            ("event_time_offset", DType::UInt32),
            ("event_id", DType::UInt32),
            ("event_time_zero", DType::UInt64),
            ("event_index", DType::UInt32),
            ("cue_index", DType::UInt32),
            ("cue_timestamp_zero", DType::UInt64),
        ] {
            file.create_dataset(&self.dataset_path(name), dtype, vec![0], true, None)?;
        }
        if let Some(Value::Object(attrs)) = attributes {
            for (name, value) in attrs {
                file.write_attribute(group_path, name, value.clone())?;
            }
        }
        Ok(())
    }

    fn reopen(&mut self, file: &mut HdfFile, group_path: &str) -> Result<(), ModuleError> {
        self.group_path = group_path.to_string();
        for name in ["event_time_offset", "event_id", "event_time_zero", "event_index"] {
            file.dataset(&self.dataset_path(name))?;
        }
        Ok(())
    }

    fn write(&mut self, file: &mut HdfFile, msg: &Msg) -> WriteResult {
        let batch = match decode_events(msg.data()) {
            Ok(batch) => batch,
            Err(message) => return WriteResult::Error { message },
        };

        let first_event_index = match file.dataset(&self.dataset_path("event_time_offset")) {
            Ok(dataset) => dataset.rows(),
            Err(e) => {
                return WriteResult::Error {
                    message: e.to_string(),
                }
            }
        };

        let group_path = self.group_path.clone();
        let append = move |file: &mut HdfFile, name: &str, row: DataBlock| -> Result<usize, String> {
            file.append_row(&format!("{}/{}", group_path, name), &row)
                .map_err(|e| e.to_string())
        };

        for (tof, id) in batch.time_of_flight.iter().zip(batch.detector_id.iter()) {
            if let Err(message) = append(file, "event_time_offset", DataBlock::UInt(vec![*tof as u64]))
                .and_then(|_| append(file, "event_id", DataBlock::UInt(vec![*id as u64])))
            {
                return WriteResult::Error { message };
            }
        }
        let row_index = match append(
            file,
            "event_time_zero",
            DataBlock::UInt(vec![batch.pulse_time_ns as u64]),
        )
        .and_then(|index| {
            append(file, "event_index", DataBlock::UInt(vec![first_event_index as u64]))?;
            Ok(index)
        }) {
            Ok(index) => index,
            Err(message) => return WriteResult::Error { message },
        };

        self.bytes_since_cue += msg.len() as u64;
        if self.bytes_since_cue >= self.index_every_bytes {
            self.bytes_since_cue = 0;
            if let Err(message) = append(file, "cue_index", DataBlock::UInt(vec![first_event_index as u64]))
                .and_then(|_| {
                    append(
                        file,
                        "cue_timestamp_zero",
                        DataBlock::UInt(vec![batch.pulse_time_ns as u64]),
                    )
                })
            {
                return WriteResult::Error { message };
            }
        }

        WriteResult::Written {
            bytes_written: msg.len(),
            row_index,
        }
    }

    fn accepts_repeated_timestamps(&self) -> bool {
        true
    }
}
