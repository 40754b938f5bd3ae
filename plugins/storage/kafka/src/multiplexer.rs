use std::sync::Arc;

use tokio::sync::mpsc;

use rill_api::{Envelope, Record};

use crate::client::FetchedRecord;
use crate::partition::PartitionState;

/// A record on its way to a partition stream, stamped with the partition's
/// seek generation at the time it was routed.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub record: Record,
    pub generation: u64,
}

/// Outcome of routing one fetched record.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Delivered,
    /// Nobody is attached to the record's partition.
    Unclaimed { partition: i32, offset: i64 },
}

struct Subscriber {
    state: Arc<PartitionState>,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Subscriber {
    fn accepts(&self, record: &Record) -> bool {
        self.state.partition() == record.partition
    }
}

/// Fans the session's single record feed out to the partition streams.
///
/// Every record is offered to all subscribers and taken by the one whose
/// partition matches, so a record reaches at most one stream. Lives on the
/// fetch-loop thread; one per session.
pub(crate) struct RecordMultiplexer {
    topic: String,
    subscribers: Vec<Subscriber>,
}

impl RecordMultiplexer {
    pub(crate) fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscribers: Vec::new(),
        }
    }

    pub(crate) fn attach(&mut self, state: Arc<PartitionState>, tx: mpsc::UnboundedSender<Delivery>) {
        let partition = state.partition();
        self.subscribers.retain(|s| s.state.partition() != partition);
        self.subscribers.push(Subscriber { state, tx });
    }

    pub(crate) fn detach(&mut self, state: &Arc<PartitionState>) {
        self.subscribers.retain(|s| !Arc::ptr_eq(&s.state, state));
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Drop every subscriber; their streams see the end of the feed.
    pub(crate) fn clear(&mut self) {
        self.subscribers.clear();
    }

    pub(crate) fn dispatch(&mut self, fetched: FetchedRecord) -> Dispatch {
        let partition = fetched.partition;
        let offset = fetched.offset;
        let mut record = Some(Record {
            envelope: Envelope {
                topic: self.topic.clone(),
                key: fetched.key,
                value: fetched.value,
            },
            ts_ms: fetched.ts_ms,
            partition,
            offset,
        });

        let mut i = 0;
        while i < self.subscribers.len() {
            let sub = &self.subscribers[i];
            if sub.tx.is_closed() {
                self.subscribers.swap_remove(i);
                continue;
            }
            let Some(rec) = record.take() else {
                break;
            };
            if !sub.accepts(&rec) {
                record = Some(rec);
                i += 1;
                continue;
            }
            let delivery = Delivery {
                record: rec,
                generation: sub.state.generation(),
            };
            match sub.tx.send(delivery) {
                Ok(()) => return Dispatch::Delivered,
                Err(mpsc::error::SendError(delivery)) => {
                    record = Some(delivery.record);
                    self.subscribers.swap_remove(i);
                }
            }
        }

        Dispatch::Unclaimed { partition, offset }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetched(partition: i32, offset: i64) -> FetchedRecord {
        FetchedRecord {
            partition,
            offset,
            ts_ms: 1_700_000_000_000 + offset,
            key: Some(format!("k{offset}").into_bytes()),
            value: Some(b"v".to_vec()),
        }
    }

    #[test]
    fn routes_only_to_matching_partition() {
        let mut mux = RecordMultiplexer::new("orders");
        let (tx0, mut rx0) = mpsc::unbounded_channel();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        mux.attach(Arc::new(PartitionState::new(0)), tx0);
        mux.attach(Arc::new(PartitionState::new(1)), tx1);

        assert_eq!(mux.dispatch(fetched(1, 10)), Dispatch::Delivered);
        assert_eq!(mux.dispatch(fetched(0, 4)), Dispatch::Delivered);
        assert_eq!(mux.dispatch(fetched(1, 11)), Dispatch::Delivered);
        assert_eq!(
            mux.dispatch(fetched(2, 7)),
            Dispatch::Unclaimed { partition: 2, offset: 7 }
        );

        let d = rx0.try_recv().unwrap();
        assert_eq!((d.record.partition, d.record.offset), (0, 4));
        assert_eq!(d.record.envelope.topic, "orders");
        assert!(rx0.try_recv().is_err());

        let offsets: Vec<i64> = std::iter::from_fn(|| rx1.try_recv().ok())
            .map(|d| d.record.offset)
            .collect();
        assert_eq!(offsets, vec![10, 11]);
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let mut mux = RecordMultiplexer::new("orders");
        let (tx, rx) = mpsc::unbounded_channel();
        mux.attach(Arc::new(PartitionState::new(0)), tx);
        drop(rx);

        assert_eq!(
            mux.dispatch(fetched(0, 1)),
            Dispatch::Unclaimed { partition: 0, offset: 1 }
        );
        assert_eq!(mux.len(), 0);
    }

    #[test]
    fn deliveries_carry_seek_generation() {
        let mut mux = RecordMultiplexer::new("orders");
        let state = Arc::new(PartitionState::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        mux.attach(state.clone(), tx);

        mux.dispatch(fetched(0, 1));
        state.bump_generation();
        mux.dispatch(fetched(0, 6));

        assert_eq!(rx.try_recv().unwrap().generation, 0);
        assert_eq!(rx.try_recv().unwrap().generation, 1);

        mux.detach(&state);
        assert_eq!(mux.len(), 0);
    }
}
