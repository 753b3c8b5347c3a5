//! Element types and typed storage for datasets

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum nesting depth of array values accepted from a template.
pub const MAX_ARRAY_DIMENSIONS: usize = 10;

/// Maximum size of a single string element accepted from a template.
pub const MAX_STRING_LENGTH: usize = 4 * 1024 * 1024;

/// Recognised dataset element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    String,
}

impl DType {
    /// Parses the `dtype` strings accepted in templates.
    pub fn parse(name: &str) -> Option<DType> {
        Some(match name {
            "uint8" => DType::UInt8,
            "uint16" => DType::UInt16,
            "uint32" => DType::UInt32,
            "uint64" => DType::UInt64,
            "int8" => DType::Int8,
            "int16" => DType::Int16,
            "int32" => DType::Int32,
            "int64" => DType::Int64,
            "float" => DType::Float,
            "double" => DType::Double,
            "string" => DType::String,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::UInt8 => "uint8",
            DType::UInt16 => "uint16",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Float => "float",
            DType::Double => "double",
            DType::String => "string",
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, DType::String)
    }

    fn is_unsigned(&self) -> bool {
        matches!(
            self,
            DType::UInt8 | DType::UInt16 | DType::UInt32 | DType::UInt64
        )
    }

    fn is_float(&self) -> bool {
        matches!(self, DType::Float | DType::Double)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Flat, typed element storage backing a dataset. Unsigned integer types
/// share a `u64` buffer, signed ones an `i64` buffer and floating point an
/// `f64` buffer; the dataset's `DType` records the declared width.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values")]
pub enum DataBlock {
    UInt(Vec<u64>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    Str(Vec<String>),
}

impl DataBlock {
    pub fn empty_for(dtype: DType) -> DataBlock {
        if dtype.is_string() {
            DataBlock::Str(Vec::new())
        } else if dtype.is_float() {
            DataBlock::Float(Vec::new())
        } else if dtype.is_unsigned() {
            DataBlock::UInt(Vec::new())
        } else {
            DataBlock::Int(Vec::new())
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DataBlock::UInt(v) => v.len(),
            DataBlock::Int(v) => v.len(),
            DataBlock::Float(v) => v.len(),
            DataBlock::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends all elements of `other`, which must have the same kind.
    pub fn extend(&mut self, other: &DataBlock) -> Result<(), String> {
        match (self, other) {
            (DataBlock::UInt(dst), DataBlock::UInt(src)) => dst.extend_from_slice(src),
            (DataBlock::Int(dst), DataBlock::Int(src)) => dst.extend_from_slice(src),
            (DataBlock::Float(dst), DataBlock::Float(src)) => dst.extend_from_slice(src),
            (DataBlock::Str(dst), DataBlock::Str(src)) => dst.extend_from_slice(src),
            (dst, src) => {
                return Err(format!(
                    "element kind mismatch: dataset holds {}, append carries {}",
                    dst.kind_name(),
                    src.kind_name()
                ))
            }
        }
        Ok(())
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            DataBlock::UInt(_) => "unsigned",
            DataBlock::Int(_) => "signed",
            DataBlock::Float(_) => "float",
            DataBlock::Str(_) => "string",
        }
    }

    fn push_json(&mut self, value: &serde_json::Value, string_size: Option<usize>) -> Result<(), String> {
        match self {
            DataBlock::UInt(v) => {
                let n = value
                    .as_u64()
                    .ok_or_else(|| format!("expect an unsigned value but got: {}", clip(value)))?;
                v.push(n);
            }
            DataBlock::Int(v) => {
                let n = value
                    .as_i64()
                    .ok_or_else(|| format!("expect an integer value but got: {}", clip(value)))?;
                v.push(n);
            }
            DataBlock::Float(v) => {
                let n = value
                    .as_f64()
                    .ok_or_else(|| format!("expect a numeric value but got: {}", clip(value)))?;
                v.push(n);
            }
            DataBlock::Str(v) => {
                let mut s = match value.as_str() {
                    Some(s) => s.to_string(),
                    None => value.to_string(),
                };
                if s.len() > MAX_STRING_LENGTH {
                    return Err(format!("string element too large: {} bytes", s.len()));
                }
                if let Some(size) = string_size {
                    s.truncate(size);
                }
                v.push(s);
            }
        }
        Ok(())
    }
}

fn clip(value: &serde_json::Value) -> String {
    let mut s = value.to_string();
    s.truncate(256);
    s
}

/// Flattens a template `values` entry (scalar or arbitrarily nested arrays)
/// into a typed block, depth-first, with the nesting capped at
/// [`MAX_ARRAY_DIMENSIONS`]. Returns the block and the inferred shape.
pub fn flatten_values(
    values: &serde_json::Value,
    dtype: DType,
    string_size: Option<usize>,
) -> Result<(DataBlock, Vec<usize>), String> {
    let mut block = DataBlock::empty_for(dtype);
    if !values.is_array() {
        block.push_json(values, string_size)?;
        return Ok((block, Vec::new()));
    }

    let mut shape = Vec::new();
    let mut level: &serde_json::Value = values;
    while let Some(arr) = level.as_array() {
        if shape.len() >= MAX_ARRAY_DIMENSIONS {
            return Err(format!(
                "array values nested deeper than {} dimensions",
                MAX_ARRAY_DIMENSIONS
            ));
        }
        shape.push(arr.len());
        match arr.first() {
            Some(first) => level = first,
            None => break,
        }
    }

    flatten_into(values, &mut block, string_size, 0)?;
    let expected: usize = shape.iter().product();
    if block.len() != expected {
        return Err(format!(
            "failed to populate value blob, size mismatch: {} != {}",
            block.len(),
            expected
        ));
    }
    Ok((block, shape))
}

fn flatten_into(
    value: &serde_json::Value,
    block: &mut DataBlock,
    string_size: Option<usize>,
    depth: usize,
) -> Result<(), String> {
    if depth > MAX_ARRAY_DIMENSIONS {
        return Err(format!(
            "array values nested deeper than {} dimensions",
            MAX_ARRAY_DIMENSIONS
        ));
    }
    match value.as_array() {
        Some(arr) => {
            for item in arr {
                flatten_into(item, block, string_size, depth + 1)?;
            }
            Ok(())
        }
        None => block.push_json(value, string_size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_value_has_empty_shape() {
        let (block, shape) = flatten_values(&json!(42), DType::Int32, None).unwrap();
        assert_eq!(block, DataBlock::Int(vec![42]));
        assert!(shape.is_empty());
    }

    #[test]
    fn nested_arrays_flatten_depth_first() {
        let (block, shape) =
            flatten_values(&json!([[1.0, 2.0], [3.0, 4.0]]), DType::Double, None).unwrap();
        assert_eq!(block, DataBlock::Float(vec![1.0, 2.0, 3.0, 4.0]));
        assert_eq!(shape, vec![2, 2]);
    }

    #[test]
    fn ragged_arrays_are_rejected() {
        let result = flatten_values(&json!([[1, 2], [3]]), DType::Int64, None);
        assert!(result.is_err());
    }

    #[test]
    fn non_string_values_in_string_dataset_are_dumped() {
        let (block, _) = flatten_values(&json!([17, "x"]), DType::String, None).unwrap();
        assert_eq!(block, DataBlock::Str(vec!["17".to_string(), "x".to_string()]));
    }

    #[test]
    fn dtype_parse_round_trip() {
        for name in [
            "uint8", "uint16", "uint32", "uint64", "int8", "int16", "int32", "int64", "float",
            "double", "string",
        ] {
            assert_eq!(DType::parse(name).unwrap().name(), name);
        }
        assert!(DType::parse("complex").is_none());
    }
}
