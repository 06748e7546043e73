//! Redis Streams backend
//!
//! Every primitive maps to one Redis command issued through a pooled
//! connection. Replies are decoded from their raw nested-array shape.

use async_trait::async_trait;
use deadpool_redis::redis::{cmd, from_redis_value, RedisResult, Value};
use deadpool_redis::{Config, Pool, Runtime};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::{GroupReadOptions, StreamStore};
use crate::batch::{RawEntry, ReadReply, StreamReply};
use crate::error::{Error, Result};
use crate::types::{ConsumerInfo, EventId, GroupCreation, PendingEntry, StartPosition};

/// Deletes the consumer only if it owns no pending entries, atomically
///
/// `KEYS[1]` stream, `ARGV[1]` group, `ARGV[2]` consumer. Returns 1 when the
/// consumer is gone, 0 when it was kept.
const REMOVE_CONSUMER_IF_IDLE: &str = r#"
if #redis.call('XPENDING', KEYS[1], ARGV[1], '-', '+', 1, ARGV[2]) > 0 then
    return 0
end
redis.call('XGROUP', 'DELCONSUMER', KEYS[1], ARGV[1], ARGV[2])
return 1
"#;

/// Raw `XPENDING` extended-form reply: `[[id, consumer, idle_ms, deliveries], ...]`
type XPendingReply = Vec<(String, String, u64, u64)>;

/// Raw `XREADGROUP` reply: `[[stream, [[id, [field, value, ...]], ...]], ...]`
type XReadReply = Option<Vec<(String, Vec<(String, Vec<String>)>)>>;

/// Connection settings for [`RedisStreamStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisStoreConfig {
    /// Redis URL, e.g. `redis://127.0.0.1:6379/0`
    pub url: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

impl RedisStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Build a connection pool from this configuration
    pub fn build_pool(&self) -> Result<Pool> {
        if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
            return Err(Error::Config(format!("Invalid Redis URL: {}", self.url)));
        }
        Ok(Config::from_url(self.url.clone()).create_pool(Some(Runtime::Tokio1))?)
    }
}

/// [`StreamStore`] backed by Redis Streams
///
/// # Example
///
/// ```no_run
/// use redstream::store::{RedisStoreConfig, RedisStreamStore, StreamStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = RedisStreamStore::new(RedisStoreConfig::new("redis://localhost:6379"));
///     store.connect().await?;
///
///     let id = store
///         .append("orders", &[("type".to_string(), "Placed".to_string())])
///         .await?;
///     println!("appended {}", id);
///     Ok(())
/// }
/// ```
pub struct RedisStreamStore {
    config: RedisStoreConfig,
    pool: Mutex<Option<Pool>>,
}

impl RedisStreamStore {
    /// Create a store. No connection is made until [`StreamStore::connect`].
    pub fn new(config: RedisStoreConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Pool>> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        let pool = self
            .slot()
            .clone()
            .ok_or_else(|| Error::Connection("Redis store is not connected".to_string()))?;
        Ok(pool.get().await?)
    }
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    async fn connect(&self) -> Result<()> {
        let pool = self.config.build_pool()?;

        let mut conn = pool.get().await?;
        let _: String = cmd("PING").query_async(&mut conn).await?;
        drop(conn);

        if let Some(previous) = self.slot().replace(pool) {
            previous.close();
        }
        info!(url = %self.config.url, "Connected to Redis");
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(pool) = self.slot().take() {
            pool.close();
            debug!("Closed Redis pool");
        }
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
        create_stream_if_missing: bool,
    ) -> Result<GroupCreation> {
        let mut conn = self.conn().await?;

        let mut command = cmd("XGROUP");
        command
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start.as_redis_id());
        if create_stream_if_missing {
            command.arg("MKSTREAM");
        }

        let result: RedisResult<()> = command.query_async(&mut conn).await;
        match result {
            Ok(()) => Ok(GroupCreation::Created),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(GroupCreation::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn group_read(&self, options: &GroupReadOptions) -> Result<Option<ReadReply>> {
        let mut conn = self.conn().await?;

        let mut command = cmd("XREADGROUP");
        command
            .arg("GROUP")
            .arg(&options.group_name)
            .arg(&options.consumer_name);
        // BLOCK 0 would wait forever
        if options.block_ms > 0 {
            command.arg("BLOCK").arg(options.block_ms);
        }
        command
            .arg("COUNT")
            .arg(options.count)
            .arg("STREAMS")
            .arg(&options.stream_name)
            .arg(">");

        let reply: XReadReply = command.query_async(&mut conn).await?;

        Ok(reply.map(|streams| ReadReply {
            streams: streams
                .into_iter()
                .map(|(stream, entries)| StreamReply {
                    stream,
                    entries: entries
                        .into_iter()
                        .map(|(id, fields)| RawEntry::new(id, fields))
                        .collect(),
                })
                .collect(),
        }))
    }

    async fn ack(&self, stream: &str, group: &str, id: &EventId) -> Result<bool> {
        let mut conn = self.conn().await?;
        let acked: u64 = cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(acked > 0)
    }

    async fn list_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let mut conn = self.conn().await?;

        let mut command = cmd("XPENDING");
        command.arg(stream).arg(group).arg("-").arg("+").arg(count);
        if let Some(consumer) = consumer {
            command.arg(consumer);
        }

        let rows: XPendingReply = command.query_async(&mut conn).await?;
        Ok(pending_entries(rows))
    }

    async fn list_idle_pending(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let mut conn = self.conn().await?;

        // IDLE needs Redis 6.2+
        let rows: XPendingReply = cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(pending_entries(rows))
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[EventId],
    ) -> Result<Vec<RawEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;

        let mut command = cmd("XCLAIM");
        command.arg(stream).arg(group).arg(consumer).arg(min_idle_ms);
        for id in ids {
            command.arg(id.as_str());
        }

        // Older servers answer nil for entries deleted from the stream
        let entries: Vec<Option<(String, Vec<String>)>> = command.query_async(&mut conn).await?;

        Ok(entries
            .into_iter()
            .flatten()
            .map(|(id, fields)| RawEntry::new(id, fields))
            .collect())
    }

    async fn list_consumers(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>> {
        let mut conn = self.conn().await?;
        let rows: Vec<HashMap<String, Value>> = cmd("XINFO")
            .arg("CONSUMERS")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await?;

        rows.iter().map(parse_consumer_info).collect()
    }

    async fn remove_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: u8 = cmd("EVAL")
            .arg(REMOVE_CONSUMER_IF_IDLE)
            .arg(1)
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .query_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<EventId> {
        if fields.is_empty() {
            return Err(Error::Validation("an event needs at least one field".to_string()));
        }
        let mut conn = self.conn().await?;

        let mut command = cmd("XADD");
        command.arg(stream).arg("*");
        for (key, value) in fields {
            command.arg(key).arg(value);
        }

        let id: String = command.query_async(&mut conn).await?;
        Ok(EventId::new(id))
    }

    async fn delete(&self, stream: &str, id: &EventId) -> Result<u64> {
        let mut conn = self.conn().await?;
        let deleted: u64 = cmd("XDEL")
            .arg(stream)
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(deleted)
    }

    async fn stream_len(&self, stream: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = cmd("XLEN").arg(stream).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64> {
        let mut conn = self.conn().await?;
        let trimmed: u64 = cmd("XTRIM")
            .arg(stream)
            .arg("MAXLEN")
            .arg(max_len)
            .query_async(&mut conn)
            .await?;
        Ok(trimmed)
    }

    async fn fetch(&self, stream: &str, id: &EventId) -> Result<Option<RawEntry>> {
        let mut conn = self.conn().await?;
        let entries: Vec<(String, Vec<String>)> = cmd("XRANGE")
            .arg(stream)
            .arg(id.as_str())
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;

        Ok(entries
            .into_iter()
            .next()
            .map(|(id, fields)| RawEntry::new(id, fields)))
    }
}

/// Decode one `XINFO CONSUMERS` row
fn pending_entries(rows: XPendingReply) -> Vec<PendingEntry> {
    rows.into_iter()
        .map(|(id, consumer_name, idle_ms, delivery_count)| PendingEntry {
            event_id: EventId::new(id),
            consumer_name,
            idle_ms,
            delivery_count,
        })
        .collect()
}

fn parse_consumer_info(row: &HashMap<String, Value>) -> Result<ConsumerInfo> {
    let field = |name: &str| {
        row.get(name)
            .ok_or_else(|| Error::Store(format!("XINFO CONSUMERS reply without '{}'", name)))
    };

    Ok(ConsumerInfo {
        name: from_redis_value(field("name")?)?,
        pending: from_redis_value(field("pending")?)?,
        idle_ms: from_redis_value(field("idle")?)?,
    })
}
