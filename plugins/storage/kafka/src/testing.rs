//! In-memory broker for tests.
//!
//! [`MockBroker`] implements both [`BrokerConnector`] and [`RecordProducer`].
//! It keeps one log per `(topic, partition)` and models a single consumer
//! group member per session: the test drives rebalances by hand
//! ([`MockBroker::assign`], [`MockBroker::revoke`]) and inspects what the
//! fetch loop did to the session (pauses, resumes, seeks).
//!
//! ```rust,ignore
//! let broker = MockBroker::new(2);
//! let storage = broker.storage(KafkaStorageConfig::new("mock:9092"));
//! broker.produce("orders", 0, "k", "v");
//! let mut assignments = storage.subscribe("orders", "g1", None).activate();
//! broker.assign(&[0, 1]);
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rill_api::{Envelope, ResetPolicy};

use crate::client::{BrokerConnector, BrokerConsumer, BrokerEvent, FetchedRecord, RecordProducer};
use crate::config::{ConsumerSettings, KafkaStorageConfig};
use crate::coordinator::KafkaRecordsStorage;
use crate::error::BrokerError;

const DEFAULT_PREFETCH: usize = 500;
const BASE_TS_MS: i64 = 1_700_000_000_000;

#[derive(Debug, Clone)]
struct StoredRecord {
    ts_ms: i64,
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct MockSession {
    topic: String,
    group: String,
    reset: Option<ResetPolicy>,
    events: VecDeque<BrokerEvent>,
    assigned: BTreeSet<i32>,
    paused: BTreeSet<i32>,
    positions: HashMap<i32, i64>,
    failure: Option<BrokerError>,
    ended: bool,
    closed: bool,
}

#[derive(Debug, Default)]
struct MockState {
    partitions: i32,
    logs: HashMap<(String, i32), Vec<StoredRecord>>,
    committed: HashMap<(String, i32), i64>,
    sessions: Vec<MockSession>,
    prefetch: usize,
    next_partition: i32,
    connect_failure: Option<String>,
    send_failure: Option<String>,
    fail_commands: bool,
    pauses: usize,
    resumes: usize,
    seeks: Vec<(i32, i64)>,
    settings: Vec<ConsumerSettings>,
}

impl MockState {
    fn log(&self, topic: &str, partition: i32) -> &[StoredRecord] {
        self.logs
            .get(&(topic.to_string(), partition))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn append(&mut self, topic: &str, partition: i32, key: Option<Vec<u8>>, value: Option<Vec<u8>>) -> i64 {
        let log = self.logs.entry((topic.to_string(), partition)).or_default();
        let offset = log.len() as i64;
        log.push(StoredRecord {
            ts_ms: BASE_TS_MS + offset,
            key,
            value,
        });
        offset
    }

    fn live_session(&mut self) -> Option<&mut MockSession> {
        self.sessions.iter_mut().rev().find(|s| !s.closed)
    }
}

/// In-memory stand-in for a broker cluster. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<(Mutex<MockState>, Condvar)>,
}

impl MockBroker {
    /// Broker whose topics all have `partitions` partitions (used to route
    /// published records).
    pub fn new(partitions: i32) -> Self {
        let state = MockState {
            partitions: partitions.max(1),
            prefetch: DEFAULT_PREFETCH,
            ..Default::default()
        };
        Self {
            inner: Arc::new((Mutex::new(state), Condvar::new())),
        }
    }

    /// Storage wired to this broker for both consuming and publishing.
    pub fn storage(&self, config: KafkaStorageConfig) -> KafkaRecordsStorage {
        KafkaRecordsStorage::new(config, Arc::new(self.clone()), Arc::new(self.clone()))
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let result = f(&mut self.state());
        self.inner.1.notify_all();
        result
    }

    // -- log --------------------------------------------------------------

    /// Append a record directly to a partition. Returns its offset.
    pub fn produce(&self, topic: &str, partition: i32, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> i64 {
        self.update(|s| s.append(topic, partition, Some(key.into()), Some(value.into())))
    }

    /// Number of records in a partition.
    pub fn log_len(&self, topic: &str, partition: i32) -> usize {
        self.state().log(topic, partition).len()
    }

    /// Committed position of a group: the next offset it reads.
    pub fn commit(&self, group: &str, partition: i32, next_offset: i64) {
        self.update(|s| {
            s.committed.insert((group.to_string(), partition), next_offset);
        });
    }

    // -- session control --------------------------------------------------

    /// Rebalance: hand `partitions` to the live session.
    pub fn assign(&self, partitions: &[i32]) {
        self.push_event(BrokerEvent::Assigned(partitions.to_vec()));
    }

    /// Rebalance: take `partitions` away from the live session.
    pub fn revoke(&self, partitions: &[i32]) {
        self.push_event(BrokerEvent::Revoked(partitions.to_vec()));
    }

    fn push_event(&self, event: BrokerEvent) {
        self.update(|s| {
            if let Some(session) = s.live_session() {
                session.events.push_back(event);
            }
        });
    }

    /// Make the live session's next poll fail.
    pub fn fail_session(&self, message: &str) {
        self.fail_poll(BrokerError::Client(message.to_string()));
    }

    /// Make the live session's next poll fail the way a broken group
    /// rebalance does.
    pub fn fail_rebalance(&self, message: &str) {
        self.fail_poll(BrokerError::Rebalance(message.to_string()));
    }

    fn fail_poll(&self, err: BrokerError) {
        self.update(|s| {
            if let Some(session) = s.live_session() {
                session.failure = Some(err);
            }
        });
    }

    /// End the live session normally.
    pub fn end_session(&self) {
        self.update(|s| {
            if let Some(session) = s.live_session() {
                session.ended = true;
            }
        });
    }

    /// Make the next connect fail.
    pub fn fail_connect(&self, message: &str) {
        self.update(|s| s.connect_failure = Some(message.to_string()));
    }

    /// Make every send fail with `message`, or succeed again with `None`.
    pub fn fail_sends(&self, message: Option<&str>) {
        self.update(|s| s.send_failure = message.map(str::to_string));
    }

    /// Make pause, resume and seek fail.
    pub fn fail_commands(&self, fail: bool) {
        self.update(|s| s.fail_commands = fail);
    }

    /// Records returned per partition by one poll.
    pub fn set_prefetch(&self, records: usize) {
        self.update(|s| s.prefetch = records.max(1));
    }

    // -- inspection -------------------------------------------------------

    pub fn is_paused(&self, partition: i32) -> bool {
        let state = self.state();
        state
            .sessions
            .iter()
            .rev()
            .find(|s| !s.closed)
            .is_some_and(|s| s.paused.contains(&partition))
    }

    /// Next offset the live session fetches from `partition`.
    pub fn position(&self, partition: i32) -> Option<i64> {
        let state = self.state();
        state
            .sessions
            .iter()
            .rev()
            .find(|s| !s.closed)
            .and_then(|s| s.positions.get(&partition).copied())
    }

    pub fn pauses(&self) -> usize {
        self.state().pauses
    }

    pub fn resumes(&self) -> usize {
        self.state().resumes
    }

    pub fn seeks(&self) -> Vec<(i32, i64)> {
        self.state().seeks.clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state().sessions.len()
    }

    pub fn sessions_closed(&self) -> usize {
        self.state().sessions.iter().filter(|s| s.closed).count()
    }

    pub fn last_settings(&self) -> Option<ConsumerSettings> {
        self.state().settings.last().cloned()
    }
}

impl BrokerConnector for MockBroker {
    fn connect(&self, settings: &ConsumerSettings) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let session = self.update(|s| {
            s.settings.push(settings.clone());
            if let Some(message) = s.connect_failure.take() {
                return Err(BrokerError::Client(message));
            }
            s.sessions.push(MockSession {
                topic: settings.topic.clone(),
                group: settings.group.clone(),
                reset: settings.reset,
                ..Default::default()
            });
            Ok(s.sessions.len() - 1)
        })?;
        Ok(Box::new(MockConsumer {
            broker: self.clone(),
            session,
        }))
    }
}

impl RecordProducer for MockBroker {
    fn send<'a>(
        &'a self,
        envelope: &'a Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(i32, i64), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            self.update(|s| {
                if let Some(message) = &s.send_failure {
                    return Err(BrokerError::Client(message.clone()));
                }
                let partition = match &envelope.key {
                    Some(key) => {
                        let hash = key.iter().fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(*b)));
                        (hash % s.partitions as u32) as i32
                    }
                    None => {
                        let p = s.next_partition;
                        s.next_partition = (p + 1) % s.partitions;
                        p
                    }
                };
                let offset = s.append(&envelope.topic, partition, envelope.key.clone(), envelope.value.clone());
                Ok((partition, offset))
            })
        })
    }
}

// ---------------------------------------------------------------------------
// MockConsumer
// ---------------------------------------------------------------------------

struct MockConsumer {
    broker: MockBroker,
    session: usize,
}

impl MockConsumer {
    fn with_session<R>(
        &self,
        f: impl FnOnce(&mut MockState, usize) -> Result<R, BrokerError>,
    ) -> Result<R, BrokerError> {
        self.broker.update(|s| f(s, self.session))
    }

    fn command(&self, partition: i32, f: impl FnOnce(&mut MockState, usize)) -> Result<(), BrokerError> {
        self.with_session(|s, id| {
            if s.fail_commands {
                return Err(BrokerError::Client("command rejected".into()));
            }
            if !s.sessions[id].assigned.contains(&partition) {
                return Err(BrokerError::NotAssigned(partition));
            }
            f(s, id);
            Ok(())
        })
    }
}

/// Starting position of a newly assigned partition.
fn initial_position(s: &MockState, session: &MockSession, partition: i32) -> Result<i64, BrokerError> {
    if let Some(committed) = s.committed.get(&(session.group.clone(), partition)) {
        return Ok(*committed);
    }
    match session.reset {
        Some(ResetPolicy::Earliest) => Ok(0),
        Some(ResetPolicy::Error) => Err(BrokerError::Client(format!(
            "no committed offset for partition {partition} and reset policy is error"
        ))),
        Some(ResetPolicy::Latest) | None => Ok(s.log(&session.topic, partition).len() as i64),
    }
}

/// One poll's worth of work, or `None` if there is nothing to report yet.
fn poll_once(s: &mut MockState, id: usize) -> Result<Option<Vec<BrokerEvent>>, BrokerError> {
    if let Some(err) = s.sessions[id].failure.take() {
        return Err(err);
    }

    if !s.sessions[id].events.is_empty() {
        let events: Vec<BrokerEvent> = s.sessions[id].events.drain(..).collect();
        for event in &events {
            match event {
                BrokerEvent::Assigned(partitions) => {
                    for &p in partitions {
                        let position = initial_position(s, &s.sessions[id], p)?;
                        let session = &mut s.sessions[id];
                        session.assigned.insert(p);
                        session.paused.remove(&p);
                        session.positions.insert(p, position);
                    }
                }
                BrokerEvent::Revoked(partitions) => {
                    let session = &mut s.sessions[id];
                    for p in partitions {
                        session.assigned.remove(p);
                        session.paused.remove(p);
                        session.positions.remove(p);
                    }
                }
                _ => {}
            }
        }
        return Ok(Some(events));
    }

    let prefetch = s.prefetch;
    let mut events = Vec::new();
    let session = &s.sessions[id];
    let mut advanced = Vec::new();
    for &p in session.assigned.difference(&session.paused) {
        let position = session.positions.get(&p).copied().unwrap_or(0);
        let log = s.log(&session.topic, p);
        let start = usize::try_from(position).unwrap_or(0).min(log.len());
        let end = (start + prefetch).min(log.len());
        for (i, stored) in log[start..end].iter().enumerate() {
            events.push(BrokerEvent::Record(FetchedRecord {
                partition: p,
                offset: (start + i) as i64,
                ts_ms: stored.ts_ms,
                key: stored.key.clone(),
                value: stored.value.clone(),
            }));
        }
        if end > start {
            advanced.push((p, end as i64));
        }
    }
    let session = &mut s.sessions[id];
    for (p, next) in advanced {
        session.positions.insert(p, next);
    }
    if !events.is_empty() {
        return Ok(Some(events));
    }
    if session.ended {
        return Ok(Some(vec![BrokerEvent::Closed]));
    }
    Ok(None)
}

impl BrokerConsumer for MockConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<Vec<BrokerEvent>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let (lock, ready) = &*self.broker.inner;
        let mut state = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(events) = poll_once(&mut state, self.session)? {
                return Ok(events);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            state = match ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn pause(&mut self, partition: i32) -> Result<(), BrokerError> {
        self.command(partition, |s, id| {
            s.pauses += 1;
            s.sessions[id].paused.insert(partition);
        })
    }

    fn resume(&mut self, partition: i32) -> Result<(), BrokerError> {
        self.command(partition, |s, id| {
            s.resumes += 1;
            s.sessions[id].paused.remove(&partition);
        })
    }

    fn seek(&mut self, partition: i32, offset: i64) -> Result<(), BrokerError> {
        self.command(partition, |s, id| {
            s.seeks.push((partition, offset));
            s.sessions[id].positions.insert(partition, offset);
        })
    }

    fn close(&mut self) {
        let _ = self.with_session(|s, id| {
            let session = &mut s.sessions[id];
            session.closed = true;
            session.assigned.clear();
            session.paused.clear();
            Ok(())
        });
    }
}
