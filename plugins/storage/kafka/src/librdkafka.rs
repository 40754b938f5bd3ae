//! librdkafka-backed broker client.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientContext, Message, Offset, TopicPartitionList};

use rill_api::{Envelope, RecordsStorage, StorageError, StorageFactory};

use crate::client::{BrokerConnector, BrokerConsumer, BrokerEvent, FetchedRecord, RecordProducer};
use crate::config::{ConsumerSettings, KafkaStorageConfig};
use crate::coordinator::KafkaRecordsStorage;
use crate::error::BrokerError;

/// Upper bound on records taken from the client's queue in one poll.
const MAX_POLL_RECORDS: usize = 500;
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

fn client_config<'a>(properties: impl IntoIterator<Item = (&'a String, &'a String)>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in properties {
        config.set(key.as_str(), value.as_str());
    }
    config
}

// ---------------------------------------------------------------------------
// Rebalance context
// ---------------------------------------------------------------------------

/// Consumer context that turns rebalance callbacks into [`BrokerEvent`]s.
///
/// librdkafka runs the callbacks on the thread that calls `poll`, in the
/// order the group coordinator decided them. They are queued here and
/// drained right after the poll call that triggered them, ahead of any
/// record that call returned.
pub struct RebalanceContext {
    topic: String,
    pending: Mutex<Vec<Result<BrokerEvent, BrokerError>>>,
}

impl RebalanceContext {
    fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn queue(&self) -> MutexGuard<'_, Vec<Result<BrokerEvent, BrokerError>>> {
        self.pending.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("rebalance queue lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn partitions(&self, tpl: &TopicPartitionList) -> Vec<i32> {
        tpl.elements()
            .iter()
            .filter(|e| e.topic() == self.topic)
            .map(|e| e.partition())
            .collect()
    }

    fn queue_revoked(&self, tpl: &TopicPartitionList) {
        let partitions = self.partitions(tpl);
        if partitions.is_empty() {
            return;
        }
        tracing::info!(topic = %self.topic, ?partitions, "kafka rebalance: partitions revoked");
        self.queue().push(Ok(BrokerEvent::Revoked(partitions)));
    }

    fn queue_assigned(&self, tpl: &TopicPartitionList) {
        let partitions = self.partitions(tpl);
        if partitions.is_empty() {
            return;
        }
        tracing::info!(topic = %self.topic, ?partitions, "kafka rebalance: partitions assigned");
        self.queue().push(Ok(BrokerEvent::Assigned(partitions)));
    }

    fn queue_failure(&self, message: String) {
        tracing::warn!(topic = %self.topic, error = %message, "kafka rebalance error");
        self.queue().push(Err(BrokerError::Rebalance(message)));
    }

    /// Move queued rebalance events into `events`. `Ok(true)` if there were
    /// any; a rebalance error fails the poll.
    fn drain(&self, events: &mut Vec<BrokerEvent>) -> Result<bool, BrokerError> {
        let pending = std::mem::take(&mut *self.queue());
        let rebalanced = !pending.is_empty();
        for event in pending {
            events.push(event?);
        }
        Ok(rebalanced)
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => self.queue_revoked(tpl),
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => self.queue_failure(e.to_string()),
        }
    }

    fn post_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            // Nothing is fetched for a new partition until someone asks for it.
            if let Err(e) = consumer.pause(tpl) {
                tracing::warn!(topic = %self.topic, error = %e, "pause of assigned partitions failed");
            }
            self.queue_assigned(tpl);
        }
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

pub struct RdKafkaConnector;

impl BrokerConnector for RdKafkaConnector {
    fn connect(&self, settings: &ConsumerSettings) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let properties = settings.client_properties();
        let consumer: BaseConsumer<RebalanceContext> = client_config(&properties)
            .create_with_context(RebalanceContext::new(settings.topic.clone()))?;
        consumer.subscribe(&[settings.topic.as_str()])?;
        tracing::debug!(
            topic = %settings.topic,
            group = %settings.group,
            bootstrap = %settings.bootstrap_servers,
            "kafka consumer subscribed"
        );
        Ok(Box::new(RdKafkaConsumer {
            consumer,
            topic: settings.topic.clone(),
        }))
    }
}

/// One group member.
pub struct RdKafkaConsumer {
    consumer: BaseConsumer<RebalanceContext>,
    topic: String,
}

impl RdKafkaConsumer {
    fn partition_list(&self, partition: i32) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(&self.topic, partition);
        tpl
    }

    /// One call into the client. `Ok(false)` when the batch should end:
    /// nothing was queued, or the group rebalanced and the fetch loop has to
    /// see the new assignment before more records are taken.
    fn poll_one(&mut self, timeout: Duration, events: &mut Vec<BrokerEvent>) -> Result<bool, BrokerError> {
        let polled = match self.consumer.poll(timeout) {
            None => Ok(None),
            Some(Ok(message)) => Ok(Some(FetchedRecord {
                partition: message.partition(),
                offset: message.offset(),
                ts_ms: message.timestamp().to_millis().unwrap_or(-1),
                key: message.key().map(<[u8]>::to_vec),
                value: message.payload().map(<[u8]>::to_vec),
            })),
            Some(Err(e)) => Err(e),
        };
        let rebalanced = self.consumer.context().drain(events)?;
        let polled = match polled {
            Ok(polled) => polled,
            Err(KafkaError::PartitionEOF(_)) => return Ok(!rebalanced),
            Err(e) => return Err(e.into()),
        };

        match polled {
            Some(record) => {
                events.push(BrokerEvent::Record(record));
                Ok(!rebalanced)
            }
            None => Ok(false),
        }
    }
}

impl BrokerConsumer for RdKafkaConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<BrokerEvent>, BrokerError> {
        let mut events = Vec::new();
        if !self.poll_one(timeout, &mut events)? {
            return Ok(events);
        }
        for _ in 1..MAX_POLL_RECORDS {
            if !self.poll_one(Duration::ZERO, &mut events)? {
                break;
            }
        }
        Ok(events)
    }

    fn pause(&mut self, partition: i32) -> Result<(), BrokerError> {
        self.consumer.pause(&self.partition_list(partition))?;
        Ok(())
    }

    fn resume(&mut self, partition: i32) -> Result<(), BrokerError> {
        self.consumer.resume(&self.partition_list(partition))?;
        Ok(())
    }

    fn seek(&mut self, partition: i32, offset: i64) -> Result<(), BrokerError> {
        self.consumer
            .seek(&self.topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)?;
        Ok(())
    }

    fn close(&mut self) {
        self.consumer.unsubscribe();
        self.consumer.context().queue().clear();
        tracing::debug!(topic = %self.topic, "kafka consumer unsubscribed");
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

pub struct RdKafkaProducer {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl RdKafkaProducer {
    pub fn new(config: &KafkaStorageConfig) -> Result<Self, BrokerError> {
        let properties = config.producer_properties();
        let producer: FutureProducer = client_config(&properties).create()?;
        Ok(Self {
            producer,
            delivery_timeout: config.delivery_timeout(),
        })
    }
}

impl RecordProducer for RdKafkaProducer {
    fn send<'a>(
        &'a self,
        envelope: &'a Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(i32, i64), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&envelope.topic);
            if let Some(key) = &envelope.key {
                record = record.key(key.as_slice());
            }
            if let Some(value) = &envelope.value {
                record = record.payload(value.as_slice());
            }
            self.producer
                .send(record, Timeout::After(self.delivery_timeout))
                .await
                .map_err(|(err, _)| BrokerError::from(err))
        })
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds a librdkafka-backed storage from a JSON config.
pub struct KafkaStorageFactory;

impl StorageFactory for KafkaStorageFactory {
    fn create(&self, config_json: &str) -> Result<Arc<dyn RecordsStorage>, StorageError> {
        let config = KafkaStorageConfig::from_json_str(config_json)?;
        let producer = RdKafkaProducer::new(&config).map_err(|e| {
            e.into_storage_error(rill_api::ErrorKind::Config)
                .with_context("create kafka producer")
        })?;
        tracing::info!(bootstrap = %config.bootstrap_servers, "kafka storage created");
        Ok(Arc::new(KafkaRecordsStorage::new(
            config,
            Arc::new(RdKafkaConnector),
            Arc::new(producer),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tpl(entries: &[(&str, i32)]) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        for (topic, partition) in entries {
            tpl.add_partition(topic, *partition);
        }
        tpl
    }

    #[test]
    fn rebalance_events_keep_callback_order() {
        let context = RebalanceContext::new("orders");
        context.queue_revoked(&tpl(&[("orders", 0)]));
        context.queue_assigned(&tpl(&[("orders", 0), ("audit", 3)]));

        let mut events = Vec::new();
        assert!(context.drain(&mut events).unwrap());
        assert_eq!(
            events,
            vec![BrokerEvent::Revoked(vec![0]), BrokerEvent::Assigned(vec![0])]
        );

        events.clear();
        assert!(!context.drain(&mut events).unwrap());
        assert!(events.is_empty());
    }

    #[test]
    fn other_topics_are_ignored() {
        let context = RebalanceContext::new("orders");
        context.queue_assigned(&tpl(&[("audit", 1)]));
        let mut events = Vec::new();
        assert!(!context.drain(&mut events).unwrap());
    }

    #[test]
    fn rebalance_error_fails_the_poll() {
        let context = RebalanceContext::new("orders");
        context.queue_revoked(&tpl(&[("orders", 2)]));
        context.queue_failure("group coordinator unavailable".into());

        let mut events = Vec::new();
        let err = context.drain(&mut events).unwrap_err();
        assert!(matches!(err, BrokerError::Rebalance(ref m) if m.contains("coordinator")));
        assert_eq!(events, vec![BrokerEvent::Revoked(vec![2])]);
    }
}
