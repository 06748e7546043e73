//! PostgreSQL backend
//!
//! Emulates Redis Streams with plain tables (see [`schema`]). Event ids are
//! rendered as `<global_position>-0` so they look like stream ids. Blocking
//! group reads poll every `poll_interval_ms` until the block time runs out.

pub mod connection;
pub mod schema;

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool, Transaction};
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_postgres::Row;
use tracing::{debug, info};

use super::{GroupReadOptions, StreamStore};
use crate::batch::{RawEntry, ReadReply};
use crate::error::{Error, Result};
use crate::types::{ConsumerInfo, EventId, GroupCreation, PendingEntry, StartPosition};

pub use connection::PostgresStoreConfig;

/// Milliseconds elapsed since a timestamp column, as BIGINT
macro_rules! idle_ms_sql {
    ($column:literal) => {
        concat!("(EXTRACT(EPOCH FROM (now() - ", $column, ")) * 1000)::bigint")
    };
}

/// [`StreamStore`] backed by PostgreSQL tables
pub struct PostgresStreamStore {
    config: PostgresStoreConfig,
    pool: Mutex<Option<Pool>>,
}

impl PostgresStreamStore {
    /// Create a store. No connection is made until [`StreamStore::connect`].
    pub fn new(config: PostgresStoreConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Pool>> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn client(&self) -> Result<Object> {
        let pool = self
            .slot()
            .clone()
            .ok_or_else(|| Error::Connection("PostgreSQL store is not connected".to_string()))?;
        Ok(pool.get().await?)
    }

    /// One polling attempt of a group read, in its own transaction
    async fn try_group_read(&self, options: &GroupReadOptions) -> Result<Vec<RawEntry>> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;

        let cursor = tx
            .query_opt(
                "SELECT last_delivered FROM stream_groups \
                 WHERE stream_name = $1 AND group_name = $2 FOR UPDATE",
                &[&options.stream_name, &options.group_name],
            )
            .await?
            .ok_or_else(|| no_group(&options.stream_name, &options.group_name))?;
        let last_delivered: i64 = cursor.get(0);

        touch_consumer(
            &tx,
            &options.stream_name,
            &options.group_name,
            &options.consumer_name,
        )
        .await?;

        let count = i64::try_from(options.count).unwrap_or(i64::MAX);
        let rows = tx
            .query(
                "SELECT global_position, fields FROM stream_events \
                 WHERE stream_name = $1 AND global_position > $2 \
                 ORDER BY global_position LIMIT $3",
                &[&options.stream_name, &last_delivered, &count],
            )
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        if let Some(last) = rows.last() {
            let positions: Vec<i64> = rows.iter().map(|row| row.get(0)).collect();
            let last_position: i64 = last.get(0);

            tx.execute(
                "INSERT INTO pending_entries \
                     (stream_name, group_name, global_position, consumer_name) \
                 SELECT $1, $2, position, $3 FROM unnest($4::bigint[]) AS position \
                 ON CONFLICT (stream_name, group_name, global_position) DO UPDATE \
                 SET consumer_name = EXCLUDED.consumer_name, \
                     delivered_at = now(), delivery_count = 1",
                &[
                    &options.stream_name,
                    &options.group_name,
                    &options.consumer_name,
                    &positions,
                ],
            )
            .await?;

            tx.execute(
                "UPDATE stream_groups SET last_delivered = $3 \
                 WHERE stream_name = $1 AND group_name = $2",
                &[&options.stream_name, &options.group_name, &last_position],
            )
            .await?;

            for row in &rows {
                entries.push(raw_entry(row)?);
            }
        }

        tx.commit().await?;
        Ok(entries)
    }
}

#[async_trait]
impl StreamStore for PostgresStreamStore {
    async fn connect(&self) -> Result<()> {
        let pool = self.config.build_pool()?;

        let client = pool.get().await?;
        schema::ensure_schema(&client, &self.config.schema_name).await?;
        drop(client);

        if let Some(previous) = self.slot().replace(pool) {
            previous.close();
        }
        info!(
            host = %self.config.host,
            database = %self.config.database,
            schema = %self.config.schema_name,
            "Connected to PostgreSQL"
        );
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(pool) = self.slot().take() {
            pool.close();
            debug!("Closed PostgreSQL pool");
        }
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
        create_stream_if_missing: bool,
    ) -> Result<GroupCreation> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;

        let exists = tx
            .query_opt("SELECT 1 FROM streams WHERE name = $1", &[&stream])
            .await?
            .is_some();
        if !exists {
            if !create_stream_if_missing {
                return Err(Error::Store(format!(
                    "ERR The XGROUP subcommand requires the key '{}' to exist",
                    stream
                )));
            }
            tx.execute(
                "INSERT INTO streams (name) VALUES ($1) ON CONFLICT DO NOTHING",
                &[&stream],
            )
            .await?;
        }

        let from_latest = start == StartPosition::Latest;
        let inserted = tx
            .execute(
                "INSERT INTO stream_groups (stream_name, group_name, last_delivered) \
                 VALUES ($1, $2, CASE WHEN $3 THEN \
                     (SELECT COALESCE(max(global_position), 0) FROM stream_events \
                      WHERE stream_name = $1) \
                 ELSE 0 END) \
                 ON CONFLICT DO NOTHING",
                &[&stream, &group, &from_latest],
            )
            .await?;

        tx.commit().await?;

        Ok(if inserted == 0 {
            GroupCreation::AlreadyExists
        } else {
            GroupCreation::Created
        })
    }

    async fn group_read(&self, options: &GroupReadOptions) -> Result<Option<ReadReply>> {
        let deadline = Instant::now() + Duration::from_millis(options.block_ms);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            let entries = self.try_group_read(options).await?;
            if !entries.is_empty() {
                return Ok(Some(ReadReply::single(&options.stream_name, entries)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &EventId) -> Result<bool> {
        let position = parse_position(id)?;
        let client = self.client().await?;
        let deleted = client
            .execute(
                "DELETE FROM pending_entries \
                 WHERE stream_name = $1 AND group_name = $2 AND global_position = $3",
                &[&stream, &group, &position],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn list_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        ensure_group(&tx, stream, group).await?;

        let rows = tx
            .query(
                concat!(
                    "SELECT global_position, consumer_name, ",
                    idle_ms_sql!("delivered_at"),
                    ", delivery_count FROM pending_entries \
                     WHERE stream_name = $1 AND group_name = $2 \
                       AND ($3::text IS NULL OR consumer_name = $3) \
                     ORDER BY global_position LIMIT $4"
                ),
                &[&stream, &group, &consumer, &count],
            )
            .await?;
        tx.commit().await?;

        Ok(rows.iter().map(pending_entry).collect())
    }

    async fn list_idle_pending(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        let min_idle_secs = min_idle_ms as f64 / 1000.0;
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        ensure_group(&tx, stream, group).await?;

        let rows = tx
            .query(
                concat!(
                    "SELECT global_position, consumer_name, ",
                    idle_ms_sql!("delivered_at"),
                    ", delivery_count FROM pending_entries \
                     WHERE stream_name = $1 AND group_name = $2 \
                       AND delivered_at <= now() - make_interval(secs => $3) \
                     ORDER BY global_position LIMIT $4"
                ),
                &[&stream, &group, &min_idle_secs, &count],
            )
            .await?;
        tx.commit().await?;

        Ok(rows.iter().map(pending_entry).collect())
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
        let positions = ids.iter().map(parse_position).collect::<Result<Vec<i64>>>()?;
        let min_idle_secs = min_idle_ms as f64 / 1000.0;

        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        ensure_group(&tx, stream, group).await?;
        touch_consumer(&tx, stream, group, consumer).await?;

        // Deleted from the stream: nothing left to deliver
        tx.execute(
            "DELETE FROM pending_entries p \
             WHERE p.stream_name = $1 AND p.group_name = $2 \
               AND p.global_position = ANY($3) \
               AND NOT EXISTS (SELECT 1 FROM stream_events e \
                               WHERE e.stream_name = p.stream_name \
                                 AND e.global_position = p.global_position)",
            &[&stream, &group, &positions],
        )
        .await?;

        let mut rows = tx
            .query(
                "UPDATE pending_entries p \
                 SET consumer_name = $3, delivered_at = now(), \
                     delivery_count = p.delivery_count + 1 \
                 FROM stream_events e \
                 WHERE p.stream_name = $1 AND p.group_name = $2 \
                   AND p.global_position = ANY($4) \
                   AND e.stream_name = p.stream_name \
                   AND e.global_position = p.global_position \
                   AND p.delivered_at <= now() - make_interval(secs => $5) \
                 RETURNING p.global_position, e.fields",
                &[&stream, &group, &consumer, &positions, &min_idle_secs],
            )
            .await?;
        tx.commit().await?;

        rows.sort_by_key(|row| row.get::<_, i64>(0));
        rows.iter().map(raw_entry).collect()
    }

    async fn list_consumers(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        ensure_group(&tx, stream, group).await?;

        let rows = tx
            .query(
                concat!(
                    "SELECT c.consumer_name, \
                        (SELECT count(*) FROM pending_entries p \
                         WHERE p.stream_name = c.stream_name \
                           AND p.group_name = c.group_name \
                           AND p.consumer_name = c.consumer_name), ",
                    idle_ms_sql!("c.seen_at"),
                    " FROM group_consumers c \
                     WHERE c.stream_name = $1 AND c.group_name = $2 \
                     ORDER BY c.consumer_name"
                ),
                &[&stream, &group],
            )
            .await?;
        tx.commit().await?;

        Ok(rows
            .iter()
            .map(|row| ConsumerInfo {
                name: row.get(0),
                pending: non_negative(row.get(1)),
                idle_ms: non_negative(row.get(2)),
            })
            .collect())
    }

    async fn remove_consumer(&self, stream: &str, group: &str, consumer: &str) -> Result<bool> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        ensure_group(&tx, stream, group).await?;

        // Reads and claims touch the consumer row before taking entries, so
        // holding its lock keeps new entries out until we commit
        tx.query_opt(
            "SELECT 1 FROM group_consumers \
             WHERE stream_name = $1 AND group_name = $2 AND consumer_name = $3 \
             FOR UPDATE",
            &[&stream, &group, &consumer],
        )
        .await?;

        let owns_entries: bool = tx
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pending_entries \
                 WHERE stream_name = $1 AND group_name = $2 AND consumer_name = $3)",
                &[&stream, &group, &consumer],
            )
            .await?
            .get(0);

        if !owns_entries {
            tx.execute(
                "DELETE FROM group_consumers \
                 WHERE stream_name = $1 AND group_name = $2 AND consumer_name = $3",
                &[&stream, &group, &consumer],
            )
            .await?;
        }
        tx.commit().await?;

        Ok(!owns_entries)
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<EventId> {
        if fields.is_empty() {
            return Err(Error::Validation("an event needs at least one field".to_string()));
        }
        let payload = serde_json::to_value(fields)?;

        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO streams (name) VALUES ($1) ON CONFLICT DO NOTHING",
                &[&stream],
            )
            .await?;
        let row = client
            .query_one(
                "INSERT INTO stream_events (stream_name, fields) VALUES ($1, $2) \
                 RETURNING global_position",
                &[&stream, &payload],
            )
            .await?;

        Ok(format_id(row.get(0)))
    }

    async fn delete(&self, stream: &str, id: &EventId) -> Result<u64> {
        let position = parse_position(id)?;
        let client = self.client().await?;
        Ok(client
            .execute(
                "DELETE FROM stream_events WHERE stream_name = $1 AND global_position = $2",
                &[&stream, &position],
            )
            .await?)
    }

    async fn stream_len(&self, stream: &str) -> Result<u64> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT count(*) FROM stream_events WHERE stream_name = $1",
                &[&stream],
            )
            .await?;
        Ok(non_negative(row.get(0)))
    }

    async fn trim(&self, stream: &str, max_len: u64) -> Result<u64> {
        let keep = i64::try_from(max_len).unwrap_or(i64::MAX);
        let client = self.client().await?;
        Ok(client
            .execute(
                "DELETE FROM stream_events WHERE stream_name = $1 AND global_position IN ( \
                     SELECT global_position FROM stream_events WHERE stream_name = $1 \
                     ORDER BY global_position DESC OFFSET $2)",
                &[&stream, &keep],
            )
            .await?)
    }

    async fn fetch(&self, stream: &str, id: &EventId) -> Result<Option<RawEntry>> {
        let position = parse_position(id)?;
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT global_position, fields FROM stream_events \
                 WHERE stream_name = $1 AND global_position = $2",
                &[&stream, &position],
            )
            .await?;
        row.as_ref().map(raw_entry).transpose()
    }
}

async fn ensure_group(tx: &Transaction<'_>, stream: &str, group: &str) -> Result<()> {
    tx
        .query_opt(
            "SELECT 1 FROM stream_groups WHERE stream_name = $1 AND group_name = $2",
            &[&stream, &group],
        )
        .await?
        .map(|_| ())
        .ok_or_else(|| no_group(stream, group))
}

async fn touch_consumer(
    tx: &Transaction<'_>,
    stream: &str,
    group: &str,
    consumer: &str,
) -> Result<()> {
    tx
        .execute(
            "INSERT INTO group_consumers (stream_name, group_name, consumer_name) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (stream_name, group_name, consumer_name) DO UPDATE SET seen_at = now()",
            &[&stream, &group, &consumer],
        )
        .await?;
    Ok(())
}

/// Convert a `(global_position, fields)` row
fn raw_entry(row: &Row) -> Result<RawEntry> {
    let position: i64 = row.get(0);
    let fields: Value = row.get(1);
    let pairs: Vec<(String, String)> = serde_json::from_value(fields)?;
    Ok(RawEntry::from_pairs(format_id(position).into_string(), &pairs))
}

/// Convert a `(global_position, consumer_name, idle_ms, delivery_count)` row
fn pending_entry(row: &Row) -> PendingEntry {
    PendingEntry {
        event_id: format_id(row.get(0)),
        consumer_name: row.get(1),
        idle_ms: non_negative(row.get(2)),
        delivery_count: non_negative(row.get(3)),
    }
}

fn no_group(stream: &str, group: &str) -> Error {
    Error::Store(format!(
        "NOGROUP No such key '{}' or consumer group '{}'",
        stream, group
    ))
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn format_id(position: i64) -> EventId {
    EventId::new(format!("{}-0", position))
}

/// Accepts `<position>-0` as well as a bare `<position>`
fn parse_position(id: &EventId) -> Result<i64> {
    let position = id.as_str().split('-').next().unwrap_or_default();
    position
        .parse()
        .map_err(|_| Error::Validation(format!("Invalid stream ID '{}'", id)))
}
