use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rill_api::{
    AssignmentBatch, AssignmentStream, Envelope, OffsetInfo, RecordsStorage, ResetPolicy,
    StorageError, Subscription,
};

use crate::client::{BrokerConnector, RecordProducer};
use crate::config::{ConsumerSettings, KafkaStorageConfig};
use crate::publisher::KafkaPublisher;
use crate::session::{self, RevocationRegistry, SessionOptions};

// ---------------------------------------------------------------------------
// KafkaRecordsStorage
// ---------------------------------------------------------------------------

/// Records storage backed by a Kafka-style broker.
pub struct KafkaRecordsStorage {
    config: KafkaStorageConfig,
    connector: Arc<dyn BrokerConnector>,
    publisher: KafkaPublisher,
}

impl KafkaRecordsStorage {
    pub fn new(
        config: KafkaStorageConfig,
        connector: Arc<dyn BrokerConnector>,
        producer: Arc<dyn RecordProducer>,
    ) -> Self {
        Self {
            config,
            connector,
            publisher: KafkaPublisher::new(producer),
        }
    }
}

impl RecordsStorage for KafkaRecordsStorage {
    fn publish(
        &self,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<OffsetInfo, StorageError>> + Send + '_>> {
        Box::pin(self.publisher.publish(envelope))
    }

    fn subscribe(
        &self,
        topic: &str,
        group: &str,
        reset: Option<ResetPolicy>,
    ) -> Box<dyn Subscription> {
        Box::new(KafkaSubscription {
            connector: self.connector.clone(),
            settings: self.config.consumer_settings(topic, group, reset),
            options: SessionOptions {
                poll_timeout: self.config.poll_timeout(),
                request_batch: self.config.request_batch,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// KafkaSubscription: cold until activated
// ---------------------------------------------------------------------------

pub struct KafkaSubscription {
    connector: Arc<dyn BrokerConnector>,
    settings: ConsumerSettings,
    options: SessionOptions,
}

impl Subscription for KafkaSubscription {
    fn activate(&self) -> Box<dyn AssignmentStream> {
        if self.settings.topic.is_empty() {
            return Box::new(KafkaAssignments::failed(StorageError::config(
                "subscription topic is empty",
            )));
        }
        if self.settings.group.is_empty() {
            return Box::new(KafkaAssignments::failed(StorageError::config(format!(
                "consumer group for topic '{}' is empty",
                self.settings.topic
            ))));
        }

        let handle = session::spawn_session(
            self.connector.clone(),
            self.settings.clone(),
            self.options,
        );
        Box::new(KafkaAssignments {
            batches: Some(handle.batches),
            cancel: handle.cancel,
            revocations: handle.revocations,
            failed: None,
        })
    }
}

// ---------------------------------------------------------------------------
// KafkaAssignments: the caller's end of a live session
// ---------------------------------------------------------------------------

/// Assignment batches of one session. Dropping it ends the session.
pub struct KafkaAssignments {
    batches: Option<mpsc::UnboundedReceiver<session::BatchResult>>,
    cancel: CancellationToken,
    revocations: RevocationRegistry,
    failed: Option<StorageError>,
}

impl KafkaAssignments {
    fn failed(err: StorageError) -> Self {
        let revocations = RevocationRegistry::new();
        revocations.close();
        Self {
            batches: None,
            cancel: CancellationToken::new(),
            revocations,
            failed: Some(err),
        }
    }

    async fn next_batch(&mut self) -> Option<Result<AssignmentBatch, StorageError>> {
        if let Some(err) = self.failed.take() {
            return Some(Err(err));
        }
        let batch = self.batches.as_mut()?.recv().await;
        if batch.is_none() {
            self.batches = None;
        }
        batch
    }
}

impl AssignmentStream for KafkaAssignments {
    fn recv(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<AssignmentBatch, StorageError>>> + Send + '_>>
    {
        Box::pin(self.next_batch())
    }
}

impl Drop for KafkaAssignments {
    fn drop(&mut self) {
        self.cancel.cancel();
        if !self.revocations.is_closed() {
            self.revocations.close();
        }
    }
}
