//! Payload schema readers
//!
//! Every payload carries a 4-byte ASCII schema tag at bytes 4..8. A
//! `PayloadReader` knows how to pull the source name and the timestamp out
//! of payloads with one particular tag, which is all the streaming runtime
//! itself needs; everything else about a payload is the business of the
//! writer module with the same tag.
//!
//! Readers live in a process-wide registry that is built once, before any
//! master is constructed, and is read-only afterwards.
//!
//! ## Payload envelope
//!
//! The reference schemas share a little-endian envelope:
//!
//! ```text
//! bytes 0..4    reserved length prefix (ignored on read)
//! bytes 4..8    ASCII schema tag
//! bytes 8..10   u16 source-name length n
//! bytes 10..10+n  source name (UTF-8)
//! bytes 10+n..18+n  u64 timestamp (nanoseconds)
//! remainder     schema-specific body
//! ```

use crate::nexus_writer::msg::{tag_to_string, Msg, SchemaTag};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

#[derive(Debug)]
pub enum SchemaError {
    /// Payload too short to carry the envelope or its declared fields.
    Truncated { needed: usize, actual: usize },
    /// Source name bytes are not valid UTF-8.
    BadSourceName,
    /// No reader is registered for the tag.
    UnknownSchema(String),
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::Truncated { needed, actual } => {
                write!(f, "payload truncated: need {} bytes, have {}", needed, actual)
            }
            SchemaError::BadSourceName => write!(f, "source name is not valid UTF-8"),
            SchemaError::UnknownSchema(tag) => write!(f, "no reader for schema \"{}\"", tag),
        }
    }
}

impl Error for SchemaError {}

/// Stable 64-bit hash of a source name, the key used by the per-topic
/// source registry. Computed once per source at registration and once per
/// message at decode time.
pub fn source_hash(source_name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source_name.hash(&mut hasher);
    hasher.finish()
}

/// The shared envelope of the reference schemas, parsed without copying the
/// schema-specific body.
pub struct Envelope<'a> {
    pub tag: SchemaTag,
    pub source_name: &'a str,
    pub timestamp_ns: i64,
    pub body: &'a [u8],
}

impl<'a> Envelope<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Envelope<'a>, SchemaError> {
        if payload.len() < 10 {
            return Err(SchemaError::Truncated {
                needed: 10,
                actual: payload.len(),
            });
        }
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&payload[4..8]);
        let name_len = u16::from_le_bytes([payload[8], payload[9]]) as usize;
        let ts_end = 10 + name_len + 8;
        if payload.len() < ts_end {
            return Err(SchemaError::Truncated {
                needed: ts_end,
                actual: payload.len(),
            });
        }
        let source_name = std::str::from_utf8(&payload[10..10 + name_len])
            .map_err(|_| SchemaError::BadSourceName)?;
        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&payload[10 + name_len..ts_end]);
        Ok(Envelope {
            tag,
            source_name,
            timestamp_ns: u64::from_le_bytes(ts_bytes) as i64,
            body: &payload[ts_end..],
        })
    }
}

/// Extracts runtime metadata from payloads of one schema.
pub trait PayloadReader: Send + Sync {
    /// The 4-byte tag this reader handles.
    fn tag(&self) -> SchemaTag;

    /// Cheap structural check; a payload that fails is a bad message.
    fn verify(&self, payload: &[u8]) -> bool;

    fn source_name(&self, payload: &[u8]) -> Result<String, SchemaError>;

    /// Timestamp in nanoseconds. Zero means "no timestamp" and the message
    /// is dropped by the demultiplexer.
    fn timestamp(&self, payload: &[u8]) -> Result<i64, SchemaError>;
}

struct EnvelopeReader {
    tag: SchemaTag,
    min_body: usize,
}

impl PayloadReader for EnvelopeReader {
    fn tag(&self) -> SchemaTag {
        self.tag
    }

    fn verify(&self, payload: &[u8]) -> bool {
        match Envelope::parse(payload) {
            Ok(envelope) => envelope.tag == self.tag && envelope.body.len() >= self.min_body,
            Err(_) => false,
        }
    }

    fn source_name(&self, payload: &[u8]) -> Result<String, SchemaError> {
        Ok(Envelope::parse(payload)?.source_name.to_string())
    }

    fn timestamp(&self, payload: &[u8]) -> Result<i64, SchemaError> {
        Ok(Envelope::parse(payload)?.timestamp_ns)
    }
}

/// Process-wide, read-only registry of payload readers keyed by schema tag.
pub struct PayloadReaderRegistry {
    readers: HashMap<SchemaTag, Arc<dyn PayloadReader>>,
}

impl PayloadReaderRegistry {
    fn with_defaults() -> Self {
        let mut readers: HashMap<SchemaTag, Arc<dyn PayloadReader>> = HashMap::new();
        // f142 body: u8 dtype code + u32 element count
        readers.insert(
            *b"f142",
            Arc::new(EnvelopeReader {
                tag: *b"f142",
                min_body: 5,
            }),
        );
        // ev42 body: u32 event count
        readers.insert(
            *b"ev42",
            Arc::new(EnvelopeReader {
                tag: *b"ev42",
                min_body: 4,
            }),
        );
        PayloadReaderRegistry { readers }
    }

    pub fn find(&self, tag: SchemaTag) -> Option<&Arc<dyn PayloadReader>> {
        self.readers.get(&tag)
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.readers.keys().map(|t| tag_to_string(*t)).collect();
        tags.sort();
        tags
    }
}

/// The global reader registry, built on first use and never mutated after.
pub fn payload_readers() -> &'static PayloadReaderRegistry {
    static REGISTRY: OnceLock<PayloadReaderRegistry> = OnceLock::new();
    REGISTRY.get_or_init(PayloadReaderRegistry::with_defaults)
}

/// A message that passed schema validation: the owned broker message plus
/// the metadata the demultiplexer routes on.
#[derive(Debug)]
pub struct ValidatedMessage {
    msg: Msg,
    tag: SchemaTag,
    source_name: String,
    source_hash: u64,
    timestamp_ns: i64,
}

impl ValidatedMessage {
    /// Validates the payload against the registered reader for its tag.
    pub fn decode(msg: Msg) -> Result<ValidatedMessage, SchemaError> {
        let tag = msg.schema_tag().ok_or(SchemaError::Truncated {
            needed: 8,
            actual: msg.len(),
        })?;
        let reader = payload_readers()
            .find(tag)
            .ok_or_else(|| SchemaError::UnknownSchema(tag_to_string(tag)))?;
        if !reader.verify(msg.data()) {
            return Err(SchemaError::Truncated {
                needed: 10,
                actual: msg.len(),
            });
        }
        let source_name = reader.source_name(msg.data())?;
        let timestamp_ns = reader.timestamp(msg.data())?;
        let source_hash = source_hash(&source_name);
        Ok(ValidatedMessage {
            msg,
            tag,
            source_name,
            source_hash,
            timestamp_ns,
        })
    }

    pub fn msg(&self) -> &Msg {
        &self.msg
    }

    pub fn tag(&self) -> SchemaTag {
        self.tag
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn source_hash(&self) -> u64 {
        self.source_hash
    }

    pub fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }
}

/// Numeric element codes used by the f142 body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum F142ElementType {
    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    Int64 = 4,
    UInt8 = 5,
    UInt16 = 6,
    UInt32 = 7,
    UInt64 = 8,
    Float = 9,
    Double = 10,
}

impl F142ElementType {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => F142ElementType::Int8,
            2 => F142ElementType::Int16,
            3 => F142ElementType::Int32,
            4 => F142ElementType::Int64,
            5 => F142ElementType::UInt8,
            6 => F142ElementType::UInt16,
            7 => F142ElementType::UInt32,
            8 => F142ElementType::UInt64,
            9 => F142ElementType::Float,
            10 => F142ElementType::Double,
            _ => return None,
        })
    }

    pub fn width(&self) -> usize {
        match self {
            F142ElementType::Int8 | F142ElementType::UInt8 => 1,
            F142ElementType::Int16 | F142ElementType::UInt16 => 2,
            F142ElementType::Int32 | F142ElementType::UInt32 | F142ElementType::Float => 4,
            F142ElementType::Int64 | F142ElementType::UInt64 | F142ElementType::Double => 8,
        }
    }
}

fn encode_envelope(tag: SchemaTag, source_name: &str, timestamp_ns: i64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(18 + source_name.len());
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(&tag);
    payload.extend_from_slice(&(source_name.len() as u16).to_le_bytes());
    payload.extend_from_slice(source_name.as_bytes());
    payload.extend_from_slice(&(timestamp_ns as u64).to_le_bytes());
    payload
}

/// Builds an f142 payload with `double` elements. Used by tests and by the
/// message generator tooling.
pub fn encode_f142_doubles(source_name: &str, timestamp_ns: i64, values: &[f64]) -> Vec<u8> {
    let mut payload = encode_envelope(*b"f142", source_name, timestamp_ns);
    payload.push(F142ElementType::Double as u8);
    payload.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    payload
}

/// Builds an ev42 payload from `(time_of_flight, detector_id)` pairs.
pub fn encode_ev42(source_name: &str, pulse_time_ns: i64, events: &[(u32, u32)]) -> Vec<u8> {
    let mut payload = encode_envelope(*b"ev42", source_name, pulse_time_ns);
    payload.extend_from_slice(&(events.len() as u32).to_le_bytes());
    for (tof, detector_id) in events {
        payload.extend_from_slice(&tof.to_le_bytes());
        payload.extend_from_slice(&detector_id.to_le_bytes());
    }
    payload
}
