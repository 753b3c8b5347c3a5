//! Writer module for `f142` log data: one sampled value (scalar or fixed
//! size array) per message, with its timestamp.
//!
//! Datasets created under the stream's group:
//! - `value`   configured dtype, `[unlimited]` or `[unlimited, array_size]`
//! - `time`    uint64 nanoseconds, `[unlimited]`

use super::{ModuleError, WriteResult, WriterModule};
use crate::nexus_writer::hdf::{DType, DataBlock, HdfFile};
use crate::nexus_writer::msg::Msg;
use crate::nexus_writer::schema::{Envelope, F142ElementType};
use serde_json::Value;

pub struct F142Writer {
    dtype: DType,
    array_size: usize,
    value_path: String,
    time_path: String,
}

impl Default for F142Writer {
    fn default() -> Self {
        F142Writer {
            dtype: DType::Double,
            array_size: 0,
            value_path: String::new(),
            time_path: String::new(),
        }
    }
}

impl F142Writer {
    fn decode_row(&self, payload: &[u8]) -> Result<(i64, DataBlock), String> {
        let envelope = Envelope::parse(payload).map_err(|e| e.to_string())?;
        let body = envelope.body;
        if body.len() < 5 {
            return Err(format!("f142 body too short: {} bytes", body.len()));
        }
        let element_type = F142ElementType::from_code(body[0])
            .ok_or_else(|| format!("unknown f142 element code {}", body[0]))?;
        let count = u32::from_le_bytes([body[1], body[2], body[3], body[4]]) as usize;
        let expected = if self.array_size == 0 { 1 } else { self.array_size };
        if count != expected {
            return Err(format!(
                "f142 element count {} does not match configured size {}",
                count, expected
            ));
        }
        let width = element_type.width();
        let data = &body[5..];
        if data.len() < count * width {
            return Err(format!(
                "f142 body truncated: {} elements of {} bytes in {} bytes",
                count,
                width,
                data.len()
            ));
        }

        let mut row = DataBlock::empty_for(self.dtype);
        for i in 0..count {
            let chunk = &data[i * width..(i + 1) * width];
            push_element(&mut row, element_type, chunk)?;
        }
        Ok((envelope.timestamp_ns, row))
    }
}

fn push_element(
    row: &mut DataBlock,
    element_type: F142ElementType,
    bytes: &[u8],
) -> Result<(), String> {
    // Decode at the payload's width, then store at the dataset's kind.
    let value_f64: f64;
    let value_i64: i64;
    let value_u64: u64;
    match element_type {
        F142ElementType::Int8 => {
            value_i64 = bytes[0] as i8 as i64;
            value_u64 = value_i64 as u64;
            value_f64 = value_i64 as f64;
        }
        F142ElementType::Int16 => {
            value_i64 = i16::from_le_bytes([bytes[0], bytes[1]]) as i64;
            value_u64 = value_i64 as u64;
            value_f64 = value_i64 as f64;
        }
        F142ElementType::Int32 => {
            value_i64 = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64;
            value_u64 = value_i64 as u64;
            value_f64 = value_i64 as f64;
        }
        F142ElementType::Int64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            value_i64 = i64::from_le_bytes(buf);
            value_u64 = value_i64 as u64;
            value_f64 = value_i64 as f64;
        }
        F142ElementType::UInt8 => {
            value_u64 = bytes[0] as u64;
            value_i64 = value_u64 as i64;
            value_f64 = value_u64 as f64;
        }
        F142ElementType::UInt16 => {
            value_u64 = u16::from_le_bytes([bytes[0], bytes[1]]) as u64;
            value_i64 = value_u64 as i64;
            value_f64 = value_u64 as f64;
        }
        F142ElementType::UInt32 => {
            value_u64 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64;
            value_i64 = value_u64 as i64;
            value_f64 = value_u64 as f64;
        }
        F142ElementType::UInt64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            value_u64 = u64::from_le_bytes(buf);
            value_i64 = value_u64 as i64;
            value_f64 = value_u64 as f64;
        }
        F142ElementType::Float => {
            value_f64 = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64;
            value_i64 = value_f64 as i64;
            value_u64 = value_f64 as u64;
        }
        F142ElementType::Double => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            value_f64 = f64::from_le_bytes(buf);
            value_i64 = value_f64 as i64;
            value_u64 = value_f64 as u64;
        }
    }
    match row {
        DataBlock::UInt(v) => v.push(value_u64),
        DataBlock::Int(v) => v.push(value_i64),
        DataBlock::Float(v) => v.push(value_f64),
        DataBlock::Str(_) => return Err("f142 cannot write string datasets".to_string()),
    }
    Ok(())
}

impl WriterModule for F142Writer {
    fn parse_config(&mut self, config: &Value) -> Result<(), ModuleError> {
        if let Some(type_name) = config.get("type").and_then(Value::as_str) {
            self.dtype = DType::parse(type_name).ok_or_else(|| {
                ModuleError::Config(format!("unknown value type \"{}\"", type_name))
            })?;
            if self.dtype.is_string() {
                return Err(ModuleError::Config(
                    "f142 does not support string values".to_string(),
                ));
            }
        }
        if let Some(array_size) = config.get("array_size").and_then(Value::as_u64) {
            self.array_size = array_size as usize;
        }
        Ok(())
    }

    fn init_for(
        &mut self,
        file: &mut HdfFile,
        group_path: &str,
        attributes: Option<&Value>,
    ) -> Result<(), ModuleError> {
        self.value_path = format!("{}/value", group_path);
        self.time_path = format!("{}/time", group_path);
        let value_shape = if self.array_size == 0 {
            vec![0]
        } else {
            vec![0, self.array_size]
        };
        file.create_dataset(&self.value_path, self.dtype, value_shape, true, None)?;
        file.create_dataset(&self.time_path, DType::UInt64, vec![0], true, None)?;
        file.write_attribute(&self.time_path, "units", Value::String("ns".to_string()))?;
        if let Some(Value::Object(attrs)) = attributes {
            for (name, value) in attrs {
                file.write_attribute(group_path, name, value.clone())?;
            }
        }
        Ok(())
    }

    fn reopen(&mut self, file: &mut HdfFile, group_path: &str) -> Result<(), ModuleError> {
        self.value_path = format!("{}/value", group_path);
        self.time_path = format!("{}/time", group_path);
        file.dataset(&self.value_path)?;
        file.dataset(&self.time_path)?;
        Ok(())
    }

    fn write(&mut self, file: &mut HdfFile, msg: &Msg) -> WriteResult {
        let (timestamp_ns, row) = match self.decode_row(msg.data()) {
            Ok(decoded) => decoded,
            Err(message) => return WriteResult::Error { message },
        };
        let row_index = match file.append_row(&self.value_path, &row) {
            Ok(index) => index,
            Err(e) => {
                return WriteResult::Error {
                    message: e.to_string(),
                }
            }
        };
        if let Err(e) = file.append_row(&self.time_path, &DataBlock::UInt(vec![timestamp_ns as u64]))
        {
            return WriteResult::Error {
                message: e.to_string(),
            };
        }
        WriteResult::Written {
            bytes_written: msg.len(),
            row_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nexus_writer::schema::encode_f142_doubles;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn scratch_file(stem: &str) -> (PathBuf, HdfFile) {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "nexus-writer-f142-{}-{}-{}.json",
            stem,
            std::process::id(),
            n
        ));
        let mut file = HdfFile::create(&path).unwrap();
        file.create_group("/entry/log").unwrap();
        (path, file)
    }

    fn msg(payload: Vec<u8>) -> Msg {
        Msg::owned(payload, 0, 0, None)
    }

    #[test]
    fn writes_scalar_values_and_times() {
        let (path, mut file) = scratch_file("scalar");
        let mut writer = F142Writer::default();
        writer
            .parse_config(&serde_json::json!({"type": "double"}))
            .unwrap();
        writer.init_for(&mut file, "/entry/log", None).unwrap();

        let r1 = writer.write(&mut file, &msg(encode_f142_doubles("s", 10, &[1.5])));
        let r2 = writer.write(&mut file, &msg(encode_f142_doubles("s", 20, &[2.5])));
        assert!(matches!(r1, WriteResult::Written { row_index: 0, .. }));
        assert!(matches!(r2, WriteResult::Written { row_index: 1, .. }));

        assert_eq!(
            file.dataset("/entry/log/value").unwrap().data,
            DataBlock::Float(vec![1.5, 2.5])
        );
        assert_eq!(
            file.dataset("/entry/log/time").unwrap().data,
            DataBlock::UInt(vec![10, 20])
        );
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn converts_payload_elements_to_configured_dtype() {
        let (path, mut file) = scratch_file("convert");
        let mut writer = F142Writer::default();
        writer
            .parse_config(&serde_json::json!({"type": "int32"}))
            .unwrap();
        writer.init_for(&mut file, "/entry/log", None).unwrap();

        writer.write(&mut file, &msg(encode_f142_doubles("s", 10, &[7.0])));
        assert_eq!(
            file.dataset("/entry/log/value").unwrap().data,
            DataBlock::Int(vec![7])
        );
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn array_size_mismatch_is_a_write_error() {
        let (path, mut file) = scratch_file("mismatch");
        let mut writer = F142Writer::default();
        writer
            .parse_config(&serde_json::json!({"type": "double", "array_size": 3}))
            .unwrap();
        writer.init_for(&mut file, "/entry/log", None).unwrap();

        let result = writer.write(&mut file, &msg(encode_f142_doubles("s", 10, &[1.0])));
        assert!(matches!(result, WriteResult::Error { .. }));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn reopen_rebinds_to_existing_datasets() {
        let (path, mut file) = scratch_file("reopen");
        let mut writer = F142Writer::default();
        writer.init_for(&mut file, "/entry/log", None).unwrap();
        writer.write(&mut file, &msg(encode_f142_doubles("s", 10, &[1.0])));
        file.save().unwrap();

        let mut reopened = HdfFile::open(&path).unwrap();
        let mut fresh = F142Writer::default();
        fresh.reopen(&mut reopened, "/entry/log").unwrap();
        let result = fresh.write(&mut reopened, &msg(encode_f142_doubles("s", 20, &[2.0])));
        assert!(matches!(result, WriteResult::Written { row_index: 1, .. }));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn string_type_is_rejected_at_config_time() {
        let mut writer = F142Writer::default();
        assert!(writer
            .parse_config(&serde_json::json!({"type": "string"}))
            .is_err());
    }
}
