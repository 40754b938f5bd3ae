//! One consumer-group session: the fetch loop and what it owns.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rill_api::{AssignmentBatch, ErrorKind, PartitionSource, StorageError};

use crate::client::{BrokerConnector, BrokerConsumer, BrokerEvent, FetchedRecord};
use crate::command::{Command, CommandSender};
use crate::config::ConsumerSettings;
use crate::error::BrokerError;
use crate::multiplexer::{Dispatch, RecordMultiplexer};
use crate::partition::{KafkaPartitionSource, PartitionState};

pub(crate) type BatchResult = Result<AssignmentBatch, StorageError>;

// ---------------------------------------------------------------------------
// RevocationRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Revocations {
    tokens: HashMap<i32, CancellationToken>,
    closed: bool,
}

/// Revocation gates of one session, by partition.
///
/// Shared between the fetch loop (register, revoke) and the assignment
/// stream (close on drop). Entries stay until the session ends; a gate that
/// already fired is harmless.
#[derive(Clone, Default)]
pub(crate) struct RevocationRegistry {
    inner: Arc<RwLock<Revocations>>,
}

impl RevocationRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Revocations> {
        match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("revocation registry read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Revocations> {
        match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("revocation registry write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Register the gate of a newly assigned partition. Once the registry is
    /// closed, the gate fires right away.
    pub(crate) fn register(&self, partition: i32, token: CancellationToken) {
        let mut guard = self.write();
        if guard.closed {
            token.cancel();
            return;
        }
        if let Some(previous) = guard.tokens.insert(partition, token) {
            previous.cancel();
        }
    }

    pub(crate) fn revoke(&self, partition: i32) {
        if let Some(token) = self.read().tokens.get(&partition) {
            token.cancel();
        }
    }

    /// Fire every gate and refuse new ones.
    pub(crate) fn close(&self) {
        let mut guard = self.write();
        guard.closed = true;
        for token in guard.tokens.values() {
            token.cancel();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.read().closed
    }
}

// ---------------------------------------------------------------------------
// Session spawn
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionOptions {
    pub poll_timeout: Duration,
    pub request_batch: u64,
}

/// Caller-side handles of a running session.
pub(crate) struct SessionHandle {
    pub batches: mpsc::UnboundedReceiver<BatchResult>,
    pub cancel: CancellationToken,
    pub revocations: RevocationRegistry,
}

/// Start a session on its own blocking thread. Connecting happens there too,
/// so a connection failure arrives as the first item of `batches`.
pub(crate) fn spawn_session(
    connector: Arc<dyn BrokerConnector>,
    settings: ConsumerSettings,
    options: SessionOptions,
) -> SessionHandle {
    let (batches_tx, batches) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let revocations = RevocationRegistry::new();

    let loop_cancel = cancel.clone();
    let loop_revocations = revocations.clone();
    let run = move || {
        run_session(
            connector.as_ref(),
            settings,
            options,
            batches_tx,
            loop_cancel,
            loop_revocations,
        )
    };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(run);
        }
        Err(_) => {
            std::thread::spawn(run);
        }
    }

    SessionHandle {
        batches,
        cancel,
        revocations,
    }
}

fn run_session(
    connector: &dyn BrokerConnector,
    settings: ConsumerSettings,
    options: SessionOptions,
    batches: mpsc::UnboundedSender<BatchResult>,
    cancel: CancellationToken,
    revocations: RevocationRegistry,
) {
    let topic = settings.topic.clone();
    let group = settings.group.clone();
    tracing::info!(topic = %topic, group = %group, reset = ?settings.reset, "opening session");

    let consumer = match connector.connect(&settings) {
        Ok(c) => c,
        Err(e) => {
            revocations.close();
            let err = e
                .into_storage_error(ErrorKind::SessionFailed)
                .with_context(format!("connect to topic '{topic}' as group '{group}'"));
            tracing::error!(topic = %topic, group = %group, error = %err, "session failed to open");
            let _ = batches.send(Err(err));
            return;
        }
    };

    let (commands_tx, commands) = CommandSender::channel();
    let mut fetch = FetchLoop {
        multiplexer: RecordMultiplexer::new(topic.clone()),
        topic,
        group,
        consumer,
        commands_tx,
        commands,
        batches,
        cancel,
        revocations,
        options,
        assigned: HashMap::new(),
        paused: HashSet::new(),
        unclaimed: HashMap::new(),
    };
    let result = fetch.run();
    fetch.teardown(result);
}

// ---------------------------------------------------------------------------
// FetchLoop
// ---------------------------------------------------------------------------

struct FetchLoop {
    topic: String,
    group: String,
    consumer: Box<dyn BrokerConsumer>,
    commands_tx: CommandSender,
    commands: mpsc::UnboundedReceiver<Command>,
    batches: mpsc::UnboundedSender<BatchResult>,
    cancel: CancellationToken,
    revocations: RevocationRegistry,
    options: SessionOptions,
    multiplexer: RecordMultiplexer,
    assigned: HashMap<i32, Arc<PartitionState>>,
    paused: HashSet<i32>,
    /// First record offset fetched per partition while nobody was attached.
    unclaimed: HashMap<i32, i64>,
}

impl FetchLoop {
    fn run(&mut self) -> Result<(), StorageError> {
        loop {
            if self.cancel.is_cancelled() || self.batches.is_closed() {
                tracing::debug!(topic = %self.topic, group = %self.group, "session cancelled");
                return Ok(());
            }

            while let Ok(command) = self.commands.try_recv() {
                self.execute(command);
            }

            let events = self.consumer.poll(self.options.poll_timeout).map_err(|e| {
                e.into_storage_error(ErrorKind::SessionFailed)
                    .with_context(format!("poll topic '{}'", self.topic))
            })?;

            for event in events {
                match event {
                    BrokerEvent::Assigned(partitions) => self.on_assigned(partitions),
                    BrokerEvent::Revoked(partitions) => self.on_revoked(partitions),
                    BrokerEvent::Record(record) => self.on_record(record),
                    BrokerEvent::Closed => {
                        tracing::info!(topic = %self.topic, group = %self.group, "broker ended session");
                        return Ok(());
                    }
                }
            }
        }
    }

    fn is_current(&self, state: &Arc<PartitionState>) -> bool {
        self.assigned
            .get(&state.partition())
            .is_some_and(|s| Arc::ptr_eq(s, state))
    }

    fn pause(&mut self, partition: i32) {
        if self.paused.contains(&partition) {
            return;
        }
        match self.consumer.pause(partition) {
            Ok(()) => {
                self.paused.insert(partition);
                tracing::debug!(topic = %self.topic, partition, "paused");
            }
            Err(e) => tracing::warn!(topic = %self.topic, partition, error = %e, "pause failed"),
        }
    }

    fn resume(&mut self, partition: i32) -> Result<(), BrokerError> {
        if !self.paused.contains(&partition) {
            return Ok(());
        }
        self.consumer.resume(partition)?;
        self.paused.remove(&partition);
        tracing::debug!(topic = %self.topic, partition, "resumed");
        Ok(())
    }

    fn on_assigned(&mut self, partitions: Vec<i32>) {
        let mut sources: Vec<Arc<dyn PartitionSource>> = Vec::with_capacity(partitions.len());
        for partition in partitions {
            if self.assigned.contains_key(&partition) {
                // Assigned again without a revocation in between.
                self.on_revoked(vec![partition]);
            }
            self.paused.remove(&partition);
            self.pause(partition);

            let state = Arc::new(PartitionState::new(partition));
            self.revocations
                .register(partition, state.revocation().clone());
            self.assigned.insert(partition, state.clone());
            sources.push(Arc::new(KafkaPartitionSource::new(
                state,
                self.commands_tx.clone(),
                self.options.request_batch,
            )));
        }
        if sources.is_empty() {
            return;
        }

        let batch = AssignmentBatch::new(sources);
        tracing::info!(
            topic = %self.topic,
            group = %self.group,
            partitions = ?batch.partitions(),
            "partitions assigned"
        );
        if self.batches.send(Ok(batch)).is_err() {
            tracing::debug!(topic = %self.topic, "assignment stream dropped, batch discarded");
        }
    }

    fn on_revoked(&mut self, partitions: Vec<i32>) {
        for partition in partitions {
            self.revocations.revoke(partition);
            self.paused.remove(&partition);
            self.unclaimed.remove(&partition);
            if let Some(state) = self.assigned.remove(&partition) {
                state.revocation().cancel();
                self.multiplexer.detach(&state);
                tracing::info!(topic = %self.topic, group = %self.group, partition, "partition revoked");
            }
        }
    }

    fn on_record(&mut self, record: FetchedRecord) {
        if !self.assigned.contains_key(&record.partition) {
            tracing::warn!(
                topic = %self.topic,
                partition = record.partition,
                offset = record.offset,
                "record for unassigned partition discarded"
            );
            return;
        }
        if let Dispatch::Unclaimed { partition, offset } = self.multiplexer.dispatch(record) {
            self.unclaimed.entry(partition).or_insert(offset);
        }
    }

    /// Seek `partition` so that `offset` is fetched next. Records already
    /// routed for it become stale.
    fn seek(&mut self, state: &Arc<PartitionState>, offset: i64) -> Result<(), BrokerError> {
        let partition = state.partition();
        self.consumer.seek(partition, offset)?;
        state.bump_generation();
        self.unclaimed.remove(&partition);
        tracing::debug!(topic = %self.topic, partition, offset, "seeked");
        Ok(())
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::PauseIfIdle { state } => {
                if self.is_current(&state) && state.demand() <= 0 {
                    self.pause(state.partition());
                }
            }
            Command::Resume { state, reply } => {
                let result = if self.is_current(&state) {
                    self.resume(state.partition())
                } else {
                    Err(BrokerError::NotAssigned(state.partition()))
                };
                let _ = reply.send(result);
            }
            Command::Seek {
                state,
                offset,
                reply,
            } => {
                let result = if self.is_current(&state) {
                    self.seek(&state, offset)
                } else {
                    Err(BrokerError::NotAssigned(state.partition()))
                };
                let _ = reply.send(result);
            }
            Command::Attach { state, tx } => {
                if !self.is_current(&state) {
                    // Dropping `tx` ends the stream.
                    return;
                }
                let partition = state.partition();
                self.multiplexer.attach(state.clone(), tx);
                if let Some(offset) = self.unclaimed.remove(&partition) {
                    if let Err(e) = self.seek(&state, offset) {
                        tracing::warn!(topic = %self.topic, partition, offset, error = %e, "rewind on attach failed");
                    }
                }
            }
            Command::Detach { state, rewind } => {
                self.multiplexer.detach(&state);
                if !self.is_current(&state) {
                    return;
                }
                let partition = state.partition();
                self.pause(partition);
                let unclaimed = self.unclaimed.remove(&partition);
                let target = match (rewind, unclaimed) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                if let Some(offset) = target {
                    if let Err(e) = self.seek(&state, offset) {
                        tracing::warn!(topic = %self.topic, partition, offset, error = %e, "rewind on detach failed");
                    }
                }
            }
        }
    }

    fn teardown(mut self, result: Result<(), StorageError>) {
        self.revocations.close();
        for state in self.assigned.values() {
            state.revocation().cancel();
        }
        self.assigned.clear();
        tracing::debug!(topic = %self.topic, subscribers = self.multiplexer.len(), "closing multiplexer");
        self.multiplexer.clear();
        self.commands.close();
        // Pending calls see their reply handle dropped.
        while let Ok(command) = self.commands.try_recv() {
            tracing::debug!(?command, "command dropped at teardown");
        }
        self.consumer.close();

        match result {
            Ok(()) => {
                tracing::info!(topic = %self.topic, group = %self.group, "session closed");
            }
            Err(e) => {
                tracing::error!(topic = %self.topic, group = %self.group, error = %e, "session failed");
                let _ = self.batches.send(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_fires_on_revoke_and_close() {
        let registry = RevocationRegistry::new();
        let p0 = CancellationToken::new();
        let p1 = CancellationToken::new();
        registry.register(0, p0.clone());
        registry.register(1, p1.clone());

        registry.revoke(0);
        registry.revoke(7);
        assert!(p0.is_cancelled());
        assert!(!p1.is_cancelled());

        registry.close();
        assert!(registry.is_closed());
        assert!(p1.is_cancelled());

        let late = CancellationToken::new();
        registry.register(2, late.clone());
        assert!(late.is_cancelled());
    }

    #[test]
    fn reregistering_fires_previous_gate() {
        let registry = RevocationRegistry::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        registry.register(3, first.clone());
        registry.register(3, second.clone());
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }
}
