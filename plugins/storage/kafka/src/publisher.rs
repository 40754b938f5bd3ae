use std::sync::Arc;

use rill_api::{Envelope, ErrorKind, OffsetInfo, StorageError};

use crate::client::RecordProducer;

/// Sends single records. Holds no state besides the producer handle.
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: Arc<dyn RecordProducer>,
}

impl KafkaPublisher {
    pub fn new(producer: Arc<dyn RecordProducer>) -> Self {
        Self { producer }
    }

    /// Publish one record. Never retries.
    pub async fn publish(&self, envelope: Envelope) -> Result<OffsetInfo, StorageError> {
        if envelope.topic.is_empty() {
            return Err(StorageError::publish_failed("envelope topic is empty"));
        }

        match self.producer.send(&envelope).await {
            Ok((partition, offset)) => {
                tracing::debug!(topic = %envelope.topic, partition, offset, "record published");
                Ok(OffsetInfo {
                    topic: envelope.topic,
                    partition,
                    offset,
                })
            }
            Err(e) => {
                tracing::warn!(topic = %envelope.topic, error = %e, "publish failed");
                Err(e
                    .into_storage_error(ErrorKind::PublishFailed)
                    .with_context(format!("topic '{}'", envelope.topic)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use super::*;
    use crate::error::BrokerError;

    #[derive(Default)]
    struct StubProducer {
        sent: Mutex<Vec<Envelope>>,
        reject: bool,
    }

    impl RecordProducer for StubProducer {
        fn send<'a>(
            &'a self,
            envelope: &'a Envelope,
        ) -> Pin<Box<dyn Future<Output = Result<(i32, i64), BrokerError>> + Send + 'a>> {
            Box::pin(async move {
                if self.reject {
                    return Err(BrokerError::Client("message too large".into()));
                }
                let mut sent = self.sent.lock().unwrap();
                sent.push(envelope.clone());
                Ok((2, sent.len() as i64 - 1 + 40))
            })
        }
    }

    #[tokio::test]
    async fn publish_returns_broker_position() {
        let producer = Arc::new(StubProducer::default());
        let publisher = KafkaPublisher::new(producer.clone());

        let info = publisher
            .publish(Envelope::new("orders", "k1", "{}"))
            .await
            .unwrap();
        assert_eq!(
            info,
            OffsetInfo {
                topic: "orders".into(),
                partition: 2,
                offset: 40
            }
        );
        let second = publisher.publish(Envelope::unkeyed("orders", "v")).await.unwrap();
        assert_eq!(second.offset, 41);
        assert_eq!(producer.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn broker_failure_is_publish_failed_with_cause() {
        let publisher = KafkaPublisher::new(Arc::new(StubProducer {
            reject: true,
            ..Default::default()
        }));
        let err = publisher
            .publish(Envelope::unkeyed("orders", "x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PublishFailed);
        assert!(err.message().starts_with("topic 'orders'"));
        assert!(err.source().is_some());
    }

    #[tokio::test]
    async fn empty_topic_never_reaches_broker() {
        let producer = Arc::new(StubProducer::default());
        let publisher = KafkaPublisher::new(producer.clone());
        let err = publisher.publish(Envelope::unkeyed("", "v")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PublishFailed);
        assert!(producer.sent.lock().unwrap().is_empty());
    }
}
