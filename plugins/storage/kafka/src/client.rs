//! Seam between the coordinator and the broker client library.
//!
//! The broker client does the network I/O and the group membership protocol.
//! The coordinator only sees what one poll produced and a handful of
//! per-partition commands, all issued from the fetch-loop thread.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rill_api::Envelope;

use crate::config::ConsumerSettings;
use crate::error::BrokerError;

/// A record as fetched, before the multiplexer turns it into a [`rill_api::Record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRecord {
    pub partition: i32,
    pub offset: i64,
    pub ts_ms: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

/// What happened during one poll, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Rebalance handed these partitions to this member.
    Assigned(Vec<i32>),
    /// Rebalance took these partitions away.
    Revoked(Vec<i32>),
    Record(FetchedRecord),
    /// The broker ended the session normally.
    Closed,
}

/// One consumer-group session. Not shared: owned and driven by the fetch loop.
pub trait BrokerConsumer: Send {
    /// Block for up to `timeout` and return whatever happened meanwhile.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<BrokerEvent>, BrokerError>;

    /// Stop fetching `partition` until resumed.
    fn pause(&mut self, partition: i32) -> Result<(), BrokerError>;

    fn resume(&mut self, partition: i32) -> Result<(), BrokerError>;

    /// Make `offset` the next record fetched from `partition`.
    fn seek(&mut self, partition: i32, offset: i64) -> Result<(), BrokerError>;

    /// Leave the group and release client resources.
    fn close(&mut self);
}

/// Opens consumer-group sessions.
pub trait BrokerConnector: Send + Sync {
    /// Create a client, join `settings.group` and subscribe to `settings.topic`.
    /// Called from the fetch-loop thread; may block.
    fn connect(&self, settings: &ConsumerSettings) -> Result<Box<dyn BrokerConsumer>, BrokerError>;
}

/// Publish path of the broker client.
pub trait RecordProducer: Send + Sync {
    /// Send one record. Resolves with `(partition, offset)` assigned by the broker.
    fn send<'a>(
        &'a self,
        envelope: &'a Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(i32, i64), BrokerError>> + Send + 'a>>;
}
