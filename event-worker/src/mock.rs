//! In-memory `Broker` and `DocumentStore` implementations for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time;

use async_trait::async_trait;
use event_common::event::{is_addressable, StreamRecord};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::broker::{Broker, PendingEntry};
use crate::error::{BrokerError, StoreError};
use crate::store::DocumentStore;
use crate::supervisor::Connector;

type EntryId = (u64, u64);

fn parse_id(id: &str) -> Option<EntryId> {
    match id {
        "-" => Some((0, 0)),
        "+" => Some((u64::MAX, u64::MAX)),
        _ => {
            let (ms, seq) = id.split_once('-').unwrap_or((id, "0"));
            Some((ms.parse().ok()?, seq.parse().ok()?))
        }
    }
}

fn format_id((ms, seq): EntryId) -> String {
    format!("{ms}-{seq}")
}

struct PendingInfo {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Default)]
struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingInfo>,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct BrokerState {
    streams: HashMap<String, Stream>,
    keys: HashMap<String, (String, Instant)>,
    next_id: u64,
    unavailable: bool,
    failing_reads: u32,
    failing_acks: bool,
    read_calls: usize,
    connections: usize,
}

/// A `Broker` keeping streams, consumer groups and keys in memory.
///
/// Clones share state, so a test can keep a handle while the worker owns another.
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    changes: Arc<watch::Sender<u64>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            changes: Arc::new(changes),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    fn check_available(state: &BrokerState) -> Result<(), BrokerError> {
        if state.unavailable {
            Err(BrokerError::Unavailable("connection refused".to_owned()))
        } else {
            Ok(())
        }
    }

    /// Append a message, like `XADD stream * ...`. Returns the new id.
    pub fn add(&self, stream: &str, fields: &[(&str, &str)]) -> String {
        let id = {
            let mut state = self.lock();
            state.next_id += 1;
            let id = (state.next_id, 0);
            state.streams.entry(stream.to_owned()).or_default().entries.insert(
                id,
                fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );
            id
        };
        self.notify();
        format_id(id)
    }

    /// Remove a message from the stream but not from pending lists, like `XDEL`.
    pub fn delete(&self, stream: &str, id: &str) {
        let Some(id) = parse_id(id) else { return };
        if let Some(stream) = self.lock().streams.get_mut(stream) {
            stream.entries.remove(&id);
        }
    }

    /// Ids pending in `group` on `stream`, in order.
    pub fn pending_ids(&self, stream: &str, group: &str) -> Vec<String> {
        self.lock()
            .streams
            .get(stream)
            .and_then(|stream| stream.groups.get(group))
            .map(|group| group.pending.keys().copied().map(format_id).collect())
            .unwrap_or_default()
    }

    /// Current value of a key, `None` once it expired.
    pub fn get(&self, key: &str) -> Option<String> {
        let state = self.lock();
        state
            .keys
            .get(key)
            .filter(|(_, expires_at)| Instant::now() < *expires_at)
            .map(|(value, _)| value.clone())
    }

    pub fn has_group(&self, stream: &str, group: &str) -> bool {
        self.lock()
            .streams
            .get(stream)
            .is_some_and(|stream| stream.groups.contains_key(group))
    }

    /// Make every call fail as if the server was down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
        self.notify();
    }

    /// Fail the next `count` reads.
    pub fn fail_reads(&self, count: u32) {
        self.lock().failing_reads = count;
        self.notify();
    }

    pub fn fail_acks(&self, failing: bool) {
        self.lock().failing_acks = failing;
    }

    pub fn read_calls(&self) -> usize {
        self.lock().read_calls
    }

    /// Stand-in for opening a connection: counts attempts and fails while unavailable.
    pub fn connect(&self) -> Result<Self, BrokerError> {
        let mut state = self.lock();
        state.connections += 1;
        Self::check_available(&state)?;
        Ok(self.clone())
    }

    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    fn deliver(
        state: &mut BrokerState,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamRecord>, BrokerError> {
        let mut records = Vec::new();
        for name in streams {
            let stream = state
                .streams
                .get_mut(name)
                .ok_or_else(|| BrokerError::UnexpectedReply(format!("NOGROUP {name} {group}")))?;
            let Stream { entries, groups } = stream;
            let group_state = groups
                .get_mut(group)
                .ok_or_else(|| BrokerError::UnexpectedReply(format!("NOGROUP {name} {group}")))?;

            let start = group_state.last_delivered;
            let fresh: Vec<(EntryId, HashMap<String, String>)> = entries
                .range((std::ops::Bound::Excluded(start), std::ops::Bound::Unbounded))
                .take(count)
                .map(|(id, fields)| (*id, fields.clone()))
                .collect();

            for (id, fields) in fresh {
                group_state.last_delivered = id;
                group_state.pending.insert(
                    id,
                    PendingInfo {
                        consumer: consumer.to_owned(),
                        delivered_at: Instant::now(),
                        deliveries: 1,
                    },
                );
                records.push(StreamRecord::new(name, &format_id(id), fields));
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        Self::check_available(&state)?;

        let stream = state.streams.entry(stream.to_owned()).or_default();
        if stream.groups.contains_key(group) {
            return Err(BrokerError::GroupExists(group.to_owned()));
        }
        stream.groups.insert(group.to_owned(), Group::default());
        Ok(())
    }

    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block: time::Duration,
    ) -> Result<Vec<StreamRecord>, BrokerError> {
        let deadline = Instant::now() + block;
        let mut changes = self.changes.subscribe();
        {
            let mut state = self.lock();
            state.read_calls += 1;
            if state.failing_reads > 0 {
                state.failing_reads -= 1;
                return Err(BrokerError::Unavailable("connection reset".to_owned()));
            }
        }

        loop {
            {
                let mut state = self.lock();
                Self::check_available(&state)?;
                let records = Self::deliver(&mut state, streams, group, consumer, count)?;
                if !records.is_empty() {
                    return Ok(records);
                }
            }

            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Ok(Vec::new()),
            }
        }
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        start: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, BrokerError> {
        let state = self.lock();
        Self::check_available(&state)?;
        let start = parse_id(start).ok_or_else(|| BrokerError::UnexpectedReply(start.to_owned()))?;

        let Some(group) = state
            .streams
            .get(stream)
            .and_then(|stream| stream.groups.get(group))
        else {
            return Err(BrokerError::UnexpectedReply(format!("NOGROUP {stream} {group}")));
        };

        let now = Instant::now();
        Ok(group
            .pending
            .range(start..)
            .filter(|(_, info)| consumer.map_or(true, |consumer| info.consumer == consumer))
            .take(count)
            .map(|(id, info)| PendingEntry {
                id: format_id(*id),
                consumer: info.consumer.clone(),
                idle: now.saturating_duration_since(info.delivered_at),
                deliveries: info.deliveries,
            })
            .collect())
    }

    async fn fetch(&self, stream: &str, id: &str) -> Result<Option<StreamRecord>, BrokerError> {
        let state = self.lock();
        Self::check_available(&state)?;
        let Some(key) = parse_id(id) else {
            return Ok(None);
        };

        Ok(state
            .streams
            .get(stream)
            .and_then(|s| s.entries.get(&key))
            .map(|fields| StreamRecord::new(stream, id, fields.clone())))
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: time::Duration,
        ids: &[String],
    ) -> Result<Vec<StreamRecord>, BrokerError> {
        let mut state = self.lock();
        Self::check_available(&state)?;

        let Some(Stream { entries, groups }) = state.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group) = groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut claimed = Vec::new();
        for id in ids.iter().filter_map(|id| parse_id(id)) {
            let Some(info) = group.pending.get_mut(&id) else {
                continue;
            };
            if now.saturating_duration_since(info.delivered_at) < min_idle {
                continue;
            }
            match entries.get(&id) {
                Some(fields) => {
                    info.consumer = consumer.to_owned();
                    info.delivered_at = now;
                    info.deliveries += 1;
                    claimed.push(StreamRecord::new(stream, &format_id(id), fields.clone()));
                }
                None => {
                    group.pending.remove(&id);
                }
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<u64, BrokerError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        if state.failing_acks {
            return Err(BrokerError::Unavailable("ack rejected".to_owned()));
        }

        let removed = parse_id(id)
            .and_then(|id| {
                state
                    .streams
                    .get_mut(stream)?
                    .groups
                    .get_mut(group)?
                    .pending
                    .remove(&id)
            })
            .is_some();
        Ok(u64::from(removed))
    }

    async fn set_ex(
        &self,
        key: &str,
        value: &str,
        ttl: time::Duration,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        state
            .keys
            .insert(key.to_owned(), (value.to_owned(), Instant::now() + ttl));
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Self::check_available(&self.lock())
    }
}

#[derive(Default)]
struct StoreState {
    indexes: HashMap<String, Value>,
    documents: HashMap<String, HashMap<String, Value>>,
    racing: HashSet<String>,
    rejected_ids: HashSet<String>,
    unavailable: bool,
    create_calls: usize,
    put_calls: usize,
    connections: usize,
}

/// A `DocumentStore` keeping indexes and documents in memory.
#[derive(Clone, Default)]
pub struct MockDocumentStore {
    state: Arc<Mutex<StoreState>>,
}

impl MockDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_available(state: &StoreState) -> Result<(), StoreError> {
        if state.unavailable {
            Err(StoreError::Unavailable("connection refused".to_owned()))
        } else {
            Ok(())
        }
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        self.lock()
            .documents
            .get(index)
            .and_then(|documents| documents.get(id))
            .cloned()
    }

    /// Number of documents across all indexes.
    pub fn document_count(&self) -> usize {
        self.lock().documents.values().map(HashMap::len).sum()
    }

    pub fn index_body(&self, index: &str) -> Option<Value> {
        self.lock().indexes.get(index).cloned()
    }

    pub fn indexes(&self) -> Vec<String> {
        let mut indexes: Vec<String> = self.lock().indexes.keys().cloned().collect();
        indexes.sort();
        indexes
    }

    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    pub fn put_calls(&self) -> usize {
        self.lock().put_calls
    }

    /// Pretend another writer creates `index` between our existence check and our create.
    pub fn race_on_create(&self, index: &str) {
        self.lock().racing.insert(index.to_owned());
    }

    /// Reject writes of `id`, as a mapping conflict would.
    pub fn reject_document(&self, id: &str) {
        self.lock().rejected_ids.insert(id.to_owned());
    }

    pub fn accept_document(&self, id: &str) {
        self.lock().rejected_ids.remove(id);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn connect(&self) -> Result<Self, StoreError> {
        let mut state = self.lock();
        state.connections += 1;
        Self::check_available(&state)?;
        Ok(self.clone())
    }

    pub fn connections(&self) -> usize {
        self.lock().connections
    }
}

#[async_trait]
impl DocumentStore for MockDocumentStore {
    async fn index_exists(&self, index: &str) -> Result<bool, StoreError> {
        let state = self.lock();
        Self::check_available(&state)?;
        Ok(state.indexes.contains_key(index))
    }

    async fn create_index(&self, index: &str, body: &Value) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        state.create_calls += 1;

        if state.racing.remove(index) {
            state.indexes.insert(index.to_owned(), body.clone());
        }
        if state.indexes.contains_key(index) {
            return Err(StoreError::AlreadyExists(index.to_owned()));
        }
        state.indexes.insert(index.to_owned(), body.clone());
        Ok(())
    }

    async fn put_document(
        &self,
        index: &str,
        id: &str,
        document: &Value,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        state.put_calls += 1;

        if !is_addressable(id) {
            return Err(StoreError::InvalidDocumentId(id.to_owned()));
        }
        if state.rejected_ids.contains(id) {
            return Err(StoreError::Status {
                status: http::StatusCode::BAD_REQUEST,
                body: r#"{"error":{"type":"mapper_parsing_exception"}}"#.to_owned(),
            });
        }
        state
            .documents
            .entry(index.to_owned())
            .or_default()
            .insert(id.to_owned(), document.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Self::check_available(&self.lock())
    }
}

/// Hands out clones of a `MockBroker` and a `MockDocumentStore` as fresh connections.
pub struct MockConnector {
    broker: MockBroker,
    store: MockDocumentStore,
}

impl MockConnector {
    pub fn new(broker: MockBroker, store: MockDocumentStore) -> Self {
        Self { broker, store }
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Broker = MockBroker;
    type Store = MockDocumentStore;

    async fn connect_broker(&self) -> Result<MockBroker, BrokerError> {
        self.broker.connect()
    }

    async fn connect_store(&self) -> Result<MockDocumentStore, StoreError> {
        self.store.connect()
    }
}
