//! Kafka records storage plugin.
//!
//! Implements [`rill_api::RecordsStorage`] on top of a consumer-group broker
//! client:
//!
//! - [`coordinator`] - cold subscriptions, one session per activation
//! - `session` - the fetch loop that owns the broker client
//! - `multiplexer` - routes fetched records to partition streams
//! - [`partition`] - per-partition demand, pause/resume and seek
//! - [`publisher`] - single-record publish
//! - [`client`] - the broker client seam
//!
//! The librdkafka client is behind the `rdkafka` feature; [`testing`] has an
//! in-memory broker.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod partition;
pub mod publisher;

mod command;
mod multiplexer;
mod session;

#[cfg(feature = "rdkafka")]
pub mod librdkafka;

/// In-memory broker for tests.
///
/// Available when compiling tests or with the `testing` feature.
#[cfg(any(test, feature = "testing"))]
pub mod testing;


pub use client::{BrokerConnector, BrokerConsumer, BrokerEvent, FetchedRecord, RecordProducer};
pub use config::{ConsumerSettings, KafkaStorageConfig};
pub use coordinator::{KafkaAssignments, KafkaRecordsStorage, KafkaSubscription};
pub use error::{BrokerError, ConfigError};
pub use partition::{KafkaPartitionRecords, KafkaPartitionSource};
pub use publisher::KafkaPublisher;

#[cfg(feature = "rdkafka")]
pub use librdkafka::{KafkaStorageFactory, RdKafkaConnector, RdKafkaProducer};
