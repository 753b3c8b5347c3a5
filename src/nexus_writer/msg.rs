//! Owned message buffers and their broker metadata

use std::fmt;

/// The 4-byte ASCII schema tag found at bytes 4..8 of every payload. It
/// selects both the payload reader and the writer module for a stream.
pub type SchemaTag = [u8; 4];

pub fn tag_to_string(tag: SchemaTag) -> String {
    String::from_utf8_lossy(&tag).into_owned()
}

/// An immutable message consumed from the broker: the owned payload bytes
/// plus partition, offset and the broker-assigned timestamp (milliseconds).
#[derive(Debug, Clone)]
pub struct Msg {
    data: Vec<u8>,
    partition: i32,
    offset: i64,
    broker_timestamp_ms: Option<i64>,
}

impl Msg {
    pub fn owned(
        data: Vec<u8>,
        partition: i32,
        offset: i64,
        broker_timestamp_ms: Option<i64>,
    ) -> Self {
        Msg {
            data,
            partition,
            offset,
            broker_timestamp_ms,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn broker_timestamp_ms(&self) -> Option<i64> {
        self.broker_timestamp_ms
    }

    /// The schema tag at bytes 4..8, or `None` when the payload is too short
    /// to carry one.
    pub fn schema_tag(&self) -> Option<SchemaTag> {
        if self.data.len() < 8 {
            return None;
        }
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&self.data[4..8]);
        Some(tag)
    }
}

impl fmt::Display for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Msg(partition={}, offset={}, {} bytes)",
            self.partition,
            self.offset,
            self.data.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_tag_extraction() {
        let mut payload = vec![0u8; 4];
        payload.extend_from_slice(b"f142");
        payload.extend_from_slice(&[0, 0]);
        let msg = Msg::owned(payload, 0, 7, Some(1234));
        assert_eq!(msg.schema_tag(), Some(*b"f142"));
        assert_eq!(msg.offset(), 7);
    }

    #[test]
    fn short_payload_has_no_tag() {
        let msg = Msg::owned(vec![1, 2, 3], 0, 0, None);
        assert_eq!(msg.schema_tag(), None);
    }
}
