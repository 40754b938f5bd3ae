use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::record::{Envelope, OffsetInfo, Record};

/// Where a consumer group starts reading a partition it has no committed
/// position for. Ignored once a position exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    Earliest,
    Latest,
    /// Fail the session instead of guessing.
    Error,
}

impl ResetPolicy {
    /// Value of the broker client's `auto.offset.reset` property.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetPolicy::Earliest => "earliest",
            ResetPolicy::Latest => "latest",
            ResetPolicy::Error => "error",
        }
    }
}

impl fmt::Display for ResetPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResetPolicy {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" | "smallest" | "beginning" => Ok(ResetPolicy::Earliest),
            "latest" | "largest" | "end" => Ok(ResetPolicy::Latest),
            "error" | "none" => Ok(ResetPolicy::Error),
            other => Err(StorageError::config(format!("unknown offset reset policy '{other}'"))),
        }
    }
}

/// Factory for creating a RecordsStorage from a JSON config.
///
/// Lets a host resolve storages by name without knowing concrete
/// implementations.
pub trait StorageFactory: Send + Sync {
    fn create(&self, config_json: &str) -> Result<Arc<dyn RecordsStorage>, StorageError>;
}

/// Storage plugin trait: publish one record, subscribe to a topic as a
/// member of a consumer group.
pub trait RecordsStorage: Send + Sync {
    /// Send one record. Resolves once with the assigned partition/offset,
    /// or fails once with `PublishFailed`. Never retries.
    fn publish(
        &self,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<OffsetInfo, StorageError>> + Send + '_>>;

    /// Cold subscription handle. Nothing connects until [`Subscription::activate`].
    fn subscribe(
        &self,
        topic: &str,
        group: &str,
        reset: Option<ResetPolicy>,
    ) -> Box<dyn Subscription>;
}

/// A subscription that has not started yet.
pub trait Subscription: Send + Sync {
    /// Open a fresh broker session. Every call is an independent attempt;
    /// dropping the returned stream tears the session down.
    fn activate(&self) -> Box<dyn AssignmentStream>;
}

/// Assignment batches of one live session.
pub trait AssignmentStream: Send {
    /// Next batch. `None` = session ended normally. An `Err` is terminal:
    /// the session is already torn down when it is returned.
    #[allow(clippy::type_complexity)]
    fn recv(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<AssignmentBatch, StorageError>>> + Send + '_>>;
}

/// Partitions handed to this process by one rebalance event.
#[derive(Clone, Default)]
pub struct AssignmentBatch {
    sources: Vec<Arc<dyn PartitionSource>>,
}

impl AssignmentBatch {
    pub fn new(sources: Vec<Arc<dyn PartitionSource>>) -> Self {
        Self { sources }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Partition indices in assignment order.
    pub fn partitions(&self) -> Vec<i32> {
        self.sources.iter().map(|s| s.partition()).collect()
    }

    pub fn get(&self, partition: i32) -> Option<Arc<dyn PartitionSource>> {
        self.sources.iter().find(|s| s.partition() == partition).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn PartitionSource>> {
        self.sources.iter()
    }
}

impl IntoIterator for AssignmentBatch {
    type Item = Arc<dyn PartitionSource>;
    type IntoIter = std::vec::IntoIter<Arc<dyn PartitionSource>>;

    fn into_iter(self) -> Self::IntoIter {
        self.sources.into_iter()
    }
}

impl fmt::Debug for AssignmentBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssignmentBatch")
            .field("partitions", &self.partitions())
            .finish()
    }
}

/// One assigned partition.
pub trait PartitionSource: Send + Sync {
    fn partition(&self) -> i32;

    /// The partition's record stream. Single use: a second call fails.
    /// The stream ends when the partition is revoked or the session closes.
    fn records(&self) -> Result<Box<dyn PartitionRecords>, StorageError>;

    /// Continue strictly after `position`: the next record delivered has
    /// offset `position + 1`. Resolves once the fetch loop applied it.
    fn seek_to(
        &self,
        position: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>>;
}

/// Pull-based, flow-controlled record stream of one partition.
pub trait PartitionRecords: Send {
    fn partition(&self) -> i32;

    /// Declare capacity for `n` more records.
    fn request(&self, n: u64) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Next record. `None` = revoked or session closed.
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<Record>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_policy_accepts_broker_aliases() {
        assert_eq!("earliest".parse::<ResetPolicy>().unwrap(), ResetPolicy::Earliest);
        assert_eq!("Smallest".parse::<ResetPolicy>().unwrap(), ResetPolicy::Earliest);
        assert_eq!(" latest ".parse::<ResetPolicy>().unwrap(), ResetPolicy::Latest);
        assert_eq!("none".parse::<ResetPolicy>().unwrap(), ResetPolicy::Error);
        assert!("sometimes".parse::<ResetPolicy>().is_err());
    }

    #[test]
    fn reset_policy_serde_is_snake_case() {
        let json = serde_json::to_string(&ResetPolicy::Latest).unwrap();
        assert_eq!(json, "\"latest\"");
        let back: ResetPolicy = serde_json::from_str("\"earliest\"").unwrap();
        assert_eq!(back, ResetPolicy::Earliest);
        assert_eq!(ResetPolicy::Error.to_string(), "error");
    }
}
