//! Tables emulating Redis Streams on PostgreSQL
//!
//! - `streams`: known stream keys
//! - `stream_events`: the append-only log; `global_position` is the id
//! - `stream_groups`: one delivery cursor per group
//! - `group_consumers`: consumers and their last interaction
//! - `pending_entries`: the Pending Entries List

use deadpool_postgres::Object;

use crate::error::Result;

const TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS streams (
    name        TEXT PRIMARY KEY,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS stream_events (
    global_position  BIGSERIAL PRIMARY KEY,
    stream_name      TEXT NOT NULL REFERENCES streams (name) ON DELETE CASCADE,
    fields           JSONB NOT NULL,
    time             TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS stream_events_stream_idx
    ON stream_events (stream_name, global_position);

CREATE TABLE IF NOT EXISTS stream_groups (
    stream_name     TEXT NOT NULL REFERENCES streams (name) ON DELETE CASCADE,
    group_name      TEXT NOT NULL,
    last_delivered  BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (stream_name, group_name)
);

CREATE TABLE IF NOT EXISTS group_consumers (
    stream_name    TEXT NOT NULL,
    group_name     TEXT NOT NULL,
    consumer_name  TEXT NOT NULL,
    seen_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (stream_name, group_name, consumer_name),
    FOREIGN KEY (stream_name, group_name)
        REFERENCES stream_groups (stream_name, group_name) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS pending_entries (
    stream_name      TEXT NOT NULL,
    group_name       TEXT NOT NULL,
    global_position  BIGINT NOT NULL,
    consumer_name    TEXT NOT NULL,
    delivered_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    delivery_count   BIGINT NOT NULL DEFAULT 1,
    PRIMARY KEY (stream_name, group_name, global_position),
    FOREIGN KEY (stream_name, group_name)
        REFERENCES stream_groups (stream_name, group_name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS pending_entries_consumer_idx
    ON pending_entries (stream_name, group_name, consumer_name);
"#;

/// Create the schema and tables if they do not exist yet
///
/// `schema_name` must already be validated; it is interpolated into SQL.
pub async fn ensure_schema(client: &Object, schema_name: &str) -> Result<()> {
    client
        .batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {};", schema_name))
        .await?;
    client.batch_execute(TABLES).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_table_is_idempotent() {
        let creates = TABLES.matches("CREATE TABLE").count();
        let guarded = TABLES.matches("CREATE TABLE IF NOT EXISTS").count();
        assert_eq!(creates, 5);
        assert_eq!(creates, guarded);
    }
}
