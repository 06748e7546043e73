//! In-process stream store
//!
//! Implements the same group semantics as Redis Streams (delivery cursor per
//! group, Pending Entries List with idle times and delivery counts, consumer
//! bookkeeping) without any server. Used by the test-suite and the demos.
//!
//! Test helpers:
//! - [`MemoryStreamStore::advance`] moves the store clock forward so idle
//!   times grow without sleeping
//! - [`MemoryStreamStore::fail_next_calls`] makes the next calls fail with a
//!   connection error
//! - [`MemoryStreamStore::calls`] returns the log of primitive calls
//! - [`MemoryStreamStore::before_next_call`] runs an action between two
//!   primitive calls, e.g. a delivery that races with the caller

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{GroupReadOptions, StreamStore};
use crate::batch::{RawEntry, ReadReply};
use crate::error::{Error, Result};
use crate::types::{ConsumerInfo, EventId, GroupCreation, PendingEntry, StartPosition};

/// `(milliseconds, sequence)`, the two halves of an id like `1700000000000-3`
type EntryKey = (u64, u64);

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamState>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<StoredEntry>,
    last_key: EntryKey,
    groups: HashMap<String, GroupState>,
}

struct StoredEntry {
    key: EntryKey,
    fields: Vec<(String, String)>,
}

struct GroupState {
    last_delivered: EntryKey,
    pending: BTreeMap<EntryKey, PendingState>,
    /// consumer name -> last interaction (store clock, ms)
    consumers: HashMap<String, i64>,
}

struct PendingState {
    consumer: String,
    delivered_at: i64,
    delivery_count: u64,
}

/// Test action run by [`MemoryStreamStore::before_next_call`]
type CallHook = Box<dyn FnOnce(&MemoryStreamStore) + Send>;

/// In-memory [`StreamStore`]
pub struct MemoryStreamStore {
    state: Mutex<State>,
    appended: Notify,
    clock_offset_ms: AtomicI64,
    connected: AtomicBool,
    failures_remaining: AtomicUsize,
    connects: AtomicUsize,
    calls: Mutex<Vec<String>>,
    call_hooks: Mutex<Vec<(String, CallHook)>>,
}

impl Default for MemoryStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStreamStore {
    /// Create an empty, connected store
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            appended: Notify::new(),
            clock_offset_ms: AtomicI64::new(0),
            connected: AtomicBool::new(true),
            failures_remaining: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            call_hooks: Mutex::new(Vec::new()),
        }
    }

    /// Move the store clock forward
    pub fn advance(&self, by: Duration) {
        let ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.clock_offset_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Make the next `n` primitive calls fail with [`Error::Connection`]
    pub fn fail_next_calls(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Whether the store is currently connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of successful `connect` calls
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Names of the primitives called so far, in order
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Forget the recorded calls
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Run `action` once, right before the next call to the primitive `op`
    /// does its work
    pub fn before_next_call(
        &self,
        op: &str,
        action: impl FnOnce(&MemoryStreamStore) + Send + 'static,
    ) {
        lock(&self.call_hooks).push((op.to_string(), Box::new(action)));
    }

    /// Deliver new entries to `options.consumer_name` immediately
    ///
    /// A non-blocking group read that is not recorded in [`Self::calls`].
    /// Returns how many entries were delivered.
    pub fn deliver_now(&self, options: &GroupReadOptions) -> Result<usize> {
        Ok(self.take_new(options)?.map_or(0, |entries| entries.len()))
    }

    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.clock_offset_ms.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Record the call and apply injected failures and the connection flag
    fn enter(&self, op: &str) -> Result<()> {
        lock(&self.calls).push(op.to_string());

        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Connection(format!("injected failure during {}", op)));
        }

        if op != "connect" && !self.is_connected() {
            return Err(Error::Connection("not connected".to_string()));
        }

        let hook = {
            let mut hooks = lock(&self.call_hooks);
            hooks
                .iter()
                .position(|(name, _)| name == op)
                .map(|index| hooks.remove(index).1)
        };
        if let Some(action) = hook {
            action(self);
        }
        Ok(())
    }

    fn pending_entries(
        &self,
        stream: &str,
        group: &str,
        keep: impl Fn(&PendingState, u64) -> bool,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let now = self.now_ms();
        let mut state = self.state();
        let group_state = group_mut(&mut state, stream, group)?;

        Ok(group_state
            .pending
            .iter()
            .map(|(key, p)| (key, p, elapsed_ms(now, p.delivered_at)))
            .filter(|(_, p, idle_ms)| keep(*p, *idle_ms))
            .take(count)
            .map(|(key, p, idle_ms)| PendingEntry {
                event_id: EventId::new(format_key(*key)),
                consumer_name: p.consumer.clone(),
                idle_ms,
                delivery_count: p.delivery_count,
            })
            .collect())
    }

    /// Deliver up to `count` new entries to the consumer, if any
    fn take_new(&self, options: &GroupReadOptions) -> Result<Option<Vec<RawEntry>>> {
        let now = self.now_ms();
        let mut state = self.state();
        let stream = state
            .streams
            .get_mut(&options.stream_name)
            .ok_or_else(|| no_group(&options.stream_name, &options.group_name))?;
        let StreamState { entries, groups, .. } = stream;
        let group = groups
            .get_mut(&options.group_name)
            .ok_or_else(|| no_group(&options.stream_name, &options.group_name))?;

        group.consumers.insert(options.consumer_name.clone(), now);

        let fresh: Vec<&StoredEntry> = entries
            .iter()
            .filter(|entry| entry.key > group.last_delivered)
            .take(options.count)
            .collect();

        let Some(last) = fresh.last() else {
            return Ok(None);
        };
        group.last_delivered = last.key;

        let mut delivered = Vec::with_capacity(fresh.len());
        for entry in fresh {
            group.pending.insert(
                entry.key,
                PendingState {
                    consumer: options.consumer_name.clone(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            delivered.push(RawEntry::from_pairs(format_key(entry.key), &entry.fields));
        }

        Ok(Some(delivered))
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn connect(&self) -> Result<()> {
        self.enter("connect")?;
        self.connected.store(true, Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        lock(&self.calls).push("disconnect".to_string());
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
        create_stream_if_missing: bool,
    ) -> Result<GroupCreation> {
        self.enter("create_group")?;
        let mut state = self.state();

        if !state.streams.contains_key(stream) {
            if !create_stream_if_missing {
                return Err(Error::Store(format!(
                    "ERR The XGROUP subcommand requires the key '{}' to exist",
                    stream
                )));
            }
            state.streams.insert(stream.to_string(), StreamState::default());
        }

        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;

        if stream_state.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }

        let last_delivered = match start {
            StartPosition::Latest => stream_state.last_key,
            StartPosition::Beginning => (0, 0),
        };
        stream_state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
                consumers: HashMap::new(),
            },
        );
        Ok(GroupCreation::Created)
    }

    async fn group_read(&self, options: &GroupReadOptions) -> Result<Option<ReadReply>> {
        self.enter("group_read")?;
        let deadline = Instant::now() + Duration::from_millis(options.block_ms);

        loop {
            // Register interest before checking so an append in between is not missed
            let appended = self.appended.notified();

            if let Some(entries) = self.take_new(options)? {
                return Ok(Some(ReadReply::single(&options.stream_name, entries)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, appended).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &EventId) -> Result<bool> {
        self.enter("ack")?;
        let key = parse_key(id)?;
        let mut state = self.state();
        let group_state = group_mut(&mut state, stream, group)?;
        Ok(group_state.pending.remove(&key).is_some())
    }

    async fn list_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        self.enter("list_pending")?;
        self.pending_entries(
            stream,
            group,
            |p, _| consumer.map_or(true, |c| p.consumer == c),
            count,
        )
    }

    async fn list_idle_pending(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        self.enter("list_idle_pending")?;
        self.pending_entries(stream, group, |_, idle_ms| idle_ms >= min_idle_ms, count)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[EventId],
    ) -> Result<Vec<RawEntry>> {
        self.enter("claim")?;
        let keys = ids.iter().map(parse_key).collect::<Result<Vec<_>>>()?;
        let now = self.now_ms();
        let mut state = self.state();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let StreamState { entries, groups, .. } = stream_state;
        let group_state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        group_state.consumers.insert(consumer.to_string(), now);

        let mut claimed = Vec::new();
        for key in keys {
            let Some(pending) = group_state.pending.get_mut(&key) else {
                continue;
            };
            if elapsed_ms(now, pending.delivered_at) < min_idle_ms {
                continue;
            }
            match entries.iter().find(|entry| entry.key == key) {
                Some(entry) => {
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    pending.delivery_count += 1;
                    claimed.push(RawEntry::from_pairs(format_key(key), &entry.fields));
                }
                None => {
                    // Deleted from the stream: nothing left to deliver
                    group_state.pending.remove(&key);
                }
            }
        }
        Ok(claimed)
    }

    async fn list_consumers(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>> {
        self.enter("list_consumers")?;
        let now = self.now_ms();
        let mut state = self.state();
        let group_state = group_mut(&mut state, stream, group)?;

        let mut consumers: Vec<ConsumerInfo> = group_state
            .consumers
            .iter()
            .map(|(name, seen)| ConsumerInfo {
                name: name.clone(),
                pending: group_state
                    .pending
                    .values()
                    .filter(|p| &p.consumer == name)
                    .count() as u64,
                idle_ms: elapsed_ms(now, *seen),
            })
            .collect();
        consumers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(consumers)
    }

    async fn remove_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<bool> {
        self.enter("remove_consumer")?;
        let mut state = self.state();
        let group_state = group_mut(&mut state, stream, group)?;

        if group_state.pending.values().any(|p| p.consumer == consumer) {
            return Ok(false);
        }
        group_state.consumers.remove(consumer);
        Ok(true)
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<EventId> {
        self.enter("append")?;
        if fields.is_empty() {
            return Err(Error::Validation("an event needs at least one field".to_string()));
        }
        let now = u64::try_from(self.now_ms()).unwrap_or(0);

        let id = {
            let mut state = self.state();
            let stream_state = state.streams.entry(stream.to_string()).or_default();
            let (last_ms, last_seq) = stream_state.last_key;
            let key = if now > last_ms { (now, 0) } else { (last_ms, last_seq + 1) };
            stream_state.last_key = key;
            stream_state.entries.push(StoredEntry {
                key,
                fields: fields.to_vec(),
            });
            EventId::new(format_key(key))
        };

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn delete(&self, stream: &str, id: &EventId) -> Result<u64> {
        self.enter("delete")?;
        let key = parse_key(id)?;
        let mut state = self.state();
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let before = stream_state.entries.len();
        stream_state.entries.retain(|entry| entry.key != key);
        Ok((before - stream_state.entries.len()) as u64)
    }

    async fn stream_len(&self, stream: &str) -> Result<u64> {
        self.enter("stream_len")?;
        let state = self.state();
        Ok(state
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len() as u64))
    }

    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64> {
        self.enter("trim")?;
        let mut state = self.state();
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let max_len = usize::try_from(max_len).unwrap_or(usize::MAX);
        let excess = stream_state.entries.len().saturating_sub(max_len);
        stream_state.entries.drain(..excess);
        Ok(excess as u64)
    }

    async fn fetch(&self, stream: &str, id: &EventId) -> Result<Option<RawEntry>> {
        self.enter("fetch")?;
        let key = parse_key(id)?;
        let state = self.state();
        Ok(state.streams.get(stream).and_then(|s| {
            s.entries
                .iter()
                .find(|entry| entry.key == key)
                .map(|entry| RawEntry::from_pairs(format_key(key), &entry.fields))
        }))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn group_mut<'a>(state: &'a mut State, stream: &str, group: &str) -> Result<&'a mut GroupState> {
    state
        .streams
        .get_mut(stream)
        .and_then(|s| s.groups.get_mut(group))
        .ok_or_else(|| no_group(stream, group))
}

fn no_group(stream: &str, group: &str) -> Error {
    Error::Store(format!(
        "NOGROUP No such key '{}' or consumer group '{}'",
        stream, group
    ))
}

fn elapsed_ms(now: i64, since: i64) -> u64 {
    u64::try_from(now - since).unwrap_or(0)
}

fn format_key((ms, seq): EntryKey) -> String {
    format!("{}-{}", ms, seq)
}

fn parse_key(id: &EventId) -> Result<EntryKey> {
    let invalid = || Error::Validation(format!("Invalid stream ID '{}'", id));
    let (ms, seq) = id.as_str().split_once('-').ok_or_else(invalid)?;
    Ok((
        ms.parse().map_err(|_| invalid())?,
        seq.parse().map_err(|_| invalid())?,
    ))
}
