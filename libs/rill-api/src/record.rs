use serde::{Deserialize, Serialize};

/// What a caller publishes. Key and value are opaque bytes; typed
/// (de)serialization happens above the storage layer.
///
/// `None` mirrors the broker's null key / null value (tombstone).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: Some(key.into()),
            value: Some(value.into()),
        }
    }

    /// Envelope without a key; the broker picks the partition.
    pub fn unkeyed(topic: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value: Some(value.into()),
        }
    }
}

/// A record read back from a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub envelope: Envelope,
    /// Broker timestamp in milliseconds (Unix epoch).
    pub ts_ms: i64,
    pub partition: i32,
    /// Position within the partition. Strictly increasing per partition.
    pub offset: i64,
}

/// Acknowledgement of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetInfo {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}
