use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use rill_api::{ErrorKind, PartitionRecords, PartitionSource, Record, StorageError};

use crate::command::CommandSender;
use crate::multiplexer::Delivery;

// ---------------------------------------------------------------------------
// PartitionState: shared by the fetch loop and one partition's reader
// ---------------------------------------------------------------------------

/// Flow-control state of one assigned partition.
///
/// `demand > 0` means records are wanted; otherwise the partition should be
/// paused at the broker. Demand only drops when a record is delivered, and a
/// record is only delivered while demand is positive, so it never goes
/// below zero.
pub(crate) struct PartitionState {
    partition: i32,
    demand: AtomicI64,
    /// Bumped by the fetch loop on every executed seek.
    generation: AtomicU64,
    demand_added: Notify,
    revoked: CancellationToken,
}

impl PartitionState {
    pub(crate) fn new(partition: i32) -> Self {
        Self {
            partition,
            demand: AtomicI64::new(0),
            generation: AtomicU64::new(0),
            demand_added: Notify::new(),
            revoked: CancellationToken::new(),
        }
    }

    pub(crate) fn partition(&self) -> i32 {
        self.partition
    }

    pub(crate) fn demand(&self) -> i64 {
        self.demand.load(Ordering::Acquire)
    }

    /// Add `n` to demand. Returns `(before, after)`.
    pub(crate) fn add_demand(&self, n: u64) -> (i64, i64) {
        let n = i64::try_from(n).unwrap_or(i64::MAX);
        let before = match self.demand.fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
            Some(d.saturating_add(n))
        }) {
            Ok(d) | Err(d) => d,
        };
        self.demand_added.notify_one();
        (before, before.saturating_add(n))
    }

    /// Account for one delivered record. Returns the remaining demand.
    pub(crate) fn take_one(&self) -> i64 {
        self.demand.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn revocation(&self) -> &CancellationToken {
        &self.revoked
    }
}

// ---------------------------------------------------------------------------
// KafkaPartitionSource
// ---------------------------------------------------------------------------

/// One partition handed out by an assignment batch.
pub struct KafkaPartitionSource {
    state: Arc<PartitionState>,
    commands: CommandSender,
    request_batch: u64,
    taken: AtomicBool,
}

impl KafkaPartitionSource {
    pub(crate) fn new(state: Arc<PartitionState>, commands: CommandSender, request_batch: u64) -> Self {
        Self {
            state,
            commands,
            request_batch,
            taken: AtomicBool::new(false),
        }
    }
}

impl PartitionSource for KafkaPartitionSource {
    fn partition(&self) -> i32 {
        self.state.partition()
    }

    fn records(&self) -> Result<Box<dyn PartitionRecords>, StorageError> {
        if self.taken.swap(true, Ordering::AcqRel) {
            return Err(StorageError::logic(format!(
                "records of partition {} were already taken",
                self.state.partition()
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        // A closed loop drops `tx` with the command; the stream then just ends.
        self.commands.attach(&self.state, tx);

        Ok(Box::new(KafkaPartitionRecords {
            state: self.state.clone(),
            commands: self.commands.clone(),
            rx,
            request_batch: self.request_batch,
            finished: false,
        }))
    }

    fn seek_to(
        &self,
        position: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send + '_>> {
        Box::pin(async move {
            let partition = self.state.partition();
            // The broker's seek names the next record to read.
            let next = position.checked_add(1).ok_or_else(|| {
                StorageError::logic(format!("seek position {position} out of range"))
            })?;
            self.commands
                .seek(&self.state, next)
                .await
                .map_err(|e| {
                    e.into_storage_error(ErrorKind::CommandFailed)
                        .with_context(format!("seek partition {partition} to {next}"))
                })
        })
    }
}

// ---------------------------------------------------------------------------
// KafkaPartitionRecords: the demand gate
// ---------------------------------------------------------------------------

pub struct KafkaPartitionRecords {
    state: Arc<PartitionState>,
    commands: CommandSender,
    rx: mpsc::UnboundedReceiver<Delivery>,
    request_batch: u64,
    finished: bool,
}

impl KafkaPartitionRecords {
    async fn add_demand(&self, n: u64) {
        if n == 0 || self.finished {
            return;
        }
        let (before, after) = self.state.add_demand(n);
        if before <= 0 && after > 0 {
            if let Err(e) = self.commands.resume(&self.state).await {
                tracing::warn!(partition = self.state.partition(), error = %e, "resume failed");
            }
        }
    }

    async fn next_record(&mut self) -> Option<Record> {
        if self.finished {
            return None;
        }
        let revoked = self.state.revocation().clone();

        loop {
            if revoked.is_cancelled() {
                break;
            }

            if self.state.demand() <= 0 {
                if self.request_batch > 0 {
                    self.add_demand(self.request_batch).await;
                } else {
                    tokio::select! {
                        biased;
                        _ = revoked.cancelled() => break,
                        _ = self.state.demand_added.notified() => continue,
                    }
                }
            }

            let delivery = tokio::select! {
                biased;
                _ = revoked.cancelled() => break,
                delivery = self.rx.recv() => delivery,
            };
            let Some(delivery) = delivery else {
                break;
            };
            if delivery.generation != self.state.generation() {
                tracing::trace!(
                    partition = self.state.partition(),
                    offset = delivery.record.offset,
                    "dropping record fetched before seek"
                );
                continue;
            }

            if self.state.take_one() <= 0 {
                self.commands.pause_if_idle(&self.state);
            }
            return Some(delivery.record);
        }

        self.finish();
        None
    }

    /// Stop fetching this partition and leave the multiplexer. Runs once.
    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.rx.close();
        let generation = self.state.generation();
        let mut rewind = None;
        while let Ok(delivery) = self.rx.try_recv() {
            if rewind.is_none() && delivery.generation == generation {
                rewind = Some(delivery.record.offset);
            }
        }
        self.commands.detach(&self.state, rewind);
        tracing::debug!(partition = self.state.partition(), ?rewind, "partition stream finished");
    }
}

impl PartitionRecords for KafkaPartitionRecords {
    fn partition(&self) -> i32 {
        self.state.partition()
    }

    fn request(&self, n: u64) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.add_demand(n))
    }

    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<Record>> + Send + '_>> {
        Box::pin(self.next_record())
    }
}

impl Drop for KafkaPartitionRecords {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demand_transitions() {
        let state = PartitionState::new(3);
        assert_eq!(state.add_demand(2), (0, 2));
        assert_eq!(state.take_one(), 1);
        assert_eq!(state.take_one(), 0);
        assert_eq!(state.add_demand(1), (0, 1));
        assert_eq!(state.add_demand(u64::MAX), (1, i64::MAX));
        assert_eq!(state.demand(), i64::MAX);
    }

    #[test]
    fn generation_counts_seeks() {
        let state = PartitionState::new(0);
        assert_eq!(state.generation(), 0);
        assert_eq!(state.bump_generation(), 1);
        assert_eq!(state.bump_generation(), 2);
        assert_eq!(state.generation(), 2);
    }
}
