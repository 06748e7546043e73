//! Stream store backends
//!
//! The consumer engine never talks to a database directly. Everything it
//! needs from the durable log and the group bookkeeping goes through the
//! [`StreamStore`] trait:
//!
//! | Method | Redis equivalent |
//! |---|---|
//! | `create_group` | `XGROUP CREATE ... MKSTREAM` |
//! | `group_read` | `XREADGROUP GROUP g c BLOCK ms COUNT n STREAMS s >` |
//! | `ack` | `XACK` |
//! | `list_pending` | `XPENDING s g - + n [consumer]` |
//! | `list_idle_pending` | `XPENDING s g IDLE ms - + n` |
//! | `claim` | `XCLAIM s g c min-idle id...` |
//! | `list_consumers` | `XINFO CONSUMERS` |
//! | `remove_consumer` | `XGROUP DELCONSUMER`, only if `XPENDING s g - + 1 c` is empty |
//! | `append` / `delete` / `stream_len` / `trim` / `fetch` | `XADD` / `XDEL` / `XLEN` / `XTRIM` / `XRANGE` |
//!
//! Three backends ship with the crate:
//!
//! - [`RedisStreamStore`]: Redis Streams through a `deadpool-redis` pool
//! - [`PostgresStreamStore`]: tables emulating streams, groups and the
//!   Pending Entries List through a `deadpool-postgres` pool
//! - [`MemoryStreamStore`]: in-process, with a manual clock and failure
//!   injection, for tests and demos

use async_trait::async_trait;
use std::sync::Arc;

use crate::batch::{RawEntry, ReadReply};
use crate::error::Result;
use crate::types::{ConsumerInfo, EventId, GroupCreation, PendingEntry, StartPosition};

pub mod memory;
pub mod postgres;
pub mod redis;

pub use memory::MemoryStreamStore;
pub use postgres::{PostgresStoreConfig, PostgresStreamStore};
pub use redis::{RedisStoreConfig, RedisStreamStore};

/// Options for a blocking group read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupReadOptions {
    /// Stream to read from
    pub stream_name: String,

    /// Consumer group
    pub group_name: String,

    /// Consumer the new events are delivered to
    pub consumer_name: String,

    /// Maximum time to wait for new events (milliseconds)
    pub block_ms: u64,

    /// Maximum events to return
    pub count: usize,
}

impl GroupReadOptions {
    /// Create new group read options
    pub fn new(
        stream_name: impl Into<String>,
        group_name: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> Self {
        Self {
            stream_name: stream_name.into(),
            group_name: group_name.into(),
            consumer_name: consumer_name.into(),
            block_ms: 2_000,
            count: 50,
        }
    }

    /// Set the block duration (builder pattern)
    pub fn with_block_ms(mut self, block_ms: u64) -> Self {
        self.block_ms = block_ms;
        self
    }

    /// Set the maximum number of events (builder pattern)
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }
}

/// Primitives the consumer engine needs from a stream store
///
/// Implementations must make `group_read` and `claim` atomic with respect to
/// other consumers: mutual exclusion on event ownership is entirely the
/// store's job.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Open (or re-open) the connection
    async fn connect(&self) -> Result<()>;

    /// Drop the connection. Later calls fail until `connect` succeeds.
    async fn disconnect(&self);

    /// Create a consumer group. An existing group is not an error.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
        create_stream_if_missing: bool,
    ) -> Result<GroupCreation>;

    /// Read events never delivered to any consumer of the group
    ///
    /// Blocks up to `block_ms`; returns `None` on timeout.
    async fn group_read(&self, options: &GroupReadOptions) -> Result<Option<ReadReply>>;

    /// Acknowledge an event, removing it from the Pending Entries List
    ///
    /// Returns whether an entry was actually pending.
    async fn ack(&self, stream: &str, group: &str, id: &EventId) -> Result<bool>;

    /// Snapshot of pending entries, optionally restricted to one consumer
    async fn list_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>>;

    /// Pending entries idle for at least `min_idle_ms`, oldest id first
    ///
    /// The idle filter is applied by the store before `count` is, so busy
    /// entries at the head of the list never hide idle ones behind them.
    async fn list_idle_pending(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<PendingEntry>>;

    /// Transfer ownership of pending entries to `consumer`
    ///
    /// Entries idle for less than `min_idle_ms` are left alone. Each claimed
    /// entry has its delivery count incremented and its idle time reset.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[EventId],
    ) -> Result<Vec<RawEntry>>;

    /// Consumers registered in the group
    async fn list_consumers(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>>;

    /// Remove a consumer from the group unless it owns pending entries
    ///
    /// The ownership check and the removal happen as one atomic step, so
    /// entries delivered to the consumer in the meantime are never orphaned.
    /// Returns `false`, leaving the consumer registered, when it still owns
    /// entries.
    async fn remove_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<bool>;

    /// Append an event, returning its store-assigned id
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<EventId>;

    /// Delete an event from the stream. Returns the number of entries removed.
    async fn delete(&self, stream: &str, id: &EventId) -> Result<u64>;

    /// Number of events in the stream
    async fn stream_len(&self, stream: &str) -> Result<u64>;

    /// Trim the stream to at most `max_len` events, oldest first
    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64>;

    /// Look up a single event
    async fn fetch(&self, stream: &str, id: &EventId) -> Result<Option<RawEntry>>;
}

#[async_trait]
impl<T: StreamStore + ?Sized> StreamStore for Arc<T> {
    async fn connect(&self) -> Result<()> {
        (**self).connect().await
    }

    async fn disconnect(&self) {
        (**self).disconnect().await
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
        create_stream_if_missing: bool,
    ) -> Result<GroupCreation> {
        (**self)
            .create_group(stream, group, start, create_stream_if_missing)
            .await
    }

    async fn group_read(&self, options: &GroupReadOptions) -> Result<Option<ReadReply>> {
        (**self).group_read(options).await
    }

    async fn ack(&self, stream: &str, group: &str, id: &EventId) -> Result<bool> {
        (**self).ack(stream, group, id).await
    }

    async fn list_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        (**self).list_pending(stream, group, consumer, count).await
    }

    async fn list_idle_pending(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        (**self)
            .list_idle_pending(stream, group, min_idle_ms, count)
            .await
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[EventId],
    ) -> Result<Vec<RawEntry>> {
        (**self).claim(stream, group, consumer, min_idle_ms, ids).await
    }

    async fn list_consumers(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>> {
        (**self).list_consumers(stream, group).await
    }

    async fn remove_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<bool> {
        (**self).remove_consumer(stream, group, consumer).await
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<EventId> {
        (**self).append(stream, fields).await
    }

    async fn delete(&self, stream: &str, id: &EventId) -> Result<u64> {
        (**self).delete(stream, id).await
    }

    async fn stream_len(&self, stream: &str) -> Result<u64> {
        (**self).stream_len(stream).await
    }

    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64> {
        (**self).trim(stream, max_len).await
    }

    async fn fetch(&self, stream: &str, id: &EventId) -> Result<Option<RawEntry>> {
        (**self).fetch(stream, id).await
    }
}
