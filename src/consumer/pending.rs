//! Pending Reclaimer
//!
//! Finds events that were delivered to some consumer of the group but never
//! acknowledged (the consumer crashed, or its handler failed), then either
//! replays them through the normal dispatch path or, once they have been
//! delivered more than `event_maximum_replays` times, evicts them.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::dispatch::{dispatch_batch, DispatchSummary};
use super::hooks::ConsumerHooks;
use crate::batch::{EventBatch, RawEntry, ReadReply};
use crate::config::ConsumerConfig;
use crate::error::Result;
use crate::store::StreamStore;
use crate::types::{ConsumerIdentity, EventId, PendingEntry};

/// Metadata fields added to dead-lettered events
pub const DEAD_LETTER_SOURCE_STREAM: &str = "deadLetterSourceStream";
pub const DEAD_LETTER_ORIGINAL_ID: &str = "deadLetterOriginalId";
pub const DEAD_LETTER_DELIVERY_COUNT: &str = "deadLetterDeliveryCount";
pub const DEAD_LETTER_EVICTED_AT: &str = "deadLetterEvictedAt";

/// Result of one reclaim pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimSummary {
    /// Pending entries inspected
    pub scanned: usize,

    /// Poison events acknowledged without redelivery
    pub evicted: Vec<EventId>,

    /// Evicted events that were copied to the dead-letter stream first
    pub dead_lettered: Vec<EventId>,

    /// Poison events left pending because the dead-letter copy failed
    pub deferred: Vec<EventId>,

    /// Entries this consumer took ownership of
    pub claimed: usize,

    /// Outcome of replaying the claimed entries
    pub redelivered: DispatchSummary,
}

/// Replays or evicts stuck pending entries
pub struct PendingReclaimer<S: StreamStore + ?Sized> {
    store: Arc<S>,
    identity: ConsumerIdentity,
    idle_event_timeout_ms: u64,
    event_maximum_replays: u64,
    pending_scan_limit: usize,
    dead_letter_stream: Option<String>,
}

impl<S: StreamStore + ?Sized> PendingReclaimer<S> {
    pub fn new(store: Arc<S>, identity: ConsumerIdentity, config: &ConsumerConfig) -> Self {
        Self {
            store,
            identity,
            idle_event_timeout_ms: config.idle_event_timeout_ms,
            event_maximum_replays: config.event_maximum_replays,
            pending_scan_limit: config.pending_scan_limit,
            dead_letter_stream: config.dead_letter_stream.clone(),
        }
    }

    /// Run one reclaim pass
    ///
    /// 1. Snapshot the head of the group's pending entries.
    /// 2. Evict every entry delivered more than `event_maximum_replays` times.
    /// 3. Ask the store for entries idle for at least `idle_event_timeout_ms`,
    ///    evict the ones over budget, claim the rest and redeliver them to
    ///    `hooks`.
    ///
    /// Step 3 is skipped when the snapshot covered every pending entry and
    /// none of the survivors is idle. An empty claim (another consumer got
    /// there first) is not an error.
    pub async fn process_pending_events<H>(&self, hooks: &H) -> Result<ReclaimSummary>
    where
        H: ConsumerHooks + ?Sized,
    {
        let identity = &self.identity;
        let pending = self
            .store
            .list_pending(
                &identity.stream_name,
                &identity.group_name,
                None,
                self.pending_scan_limit,
            )
            .await?;

        let mut summary = ReclaimSummary {
            scanned: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(summary);
        }
        let scan_complete = pending.len() < self.pending_scan_limit;

        let (poison, replayable): (Vec<PendingEntry>, Vec<PendingEntry>) =
            pending.into_iter().partition(|entry| self.is_poison(entry));
        for entry in &poison {
            self.evict(entry, &mut summary).await?;
        }

        if scan_complete
            && !replayable
                .iter()
                .any(|entry| entry.idle_ms >= self.idle_event_timeout_ms)
        {
            return Ok(summary);
        }

        let idle = self
            .store
            .list_idle_pending(
                &identity.stream_name,
                &identity.group_name,
                self.idle_event_timeout_ms,
                self.pending_scan_limit,
            )
            .await?;

        let mut eligible = Vec::with_capacity(idle.len());
        for entry in idle {
            if !self.is_poison(&entry) {
                eligible.push(entry.event_id);
            } else if !summary.evicted.contains(&entry.event_id)
                && !summary.deferred.contains(&entry.event_id)
            {
                self.evict(&entry, &mut summary).await?;
            }
        }
        if eligible.is_empty() {
            return Ok(summary);
        }

        let claimed = self
            .store
            .claim(
                &identity.stream_name,
                &identity.group_name,
                &identity.consumer_name,
                self.idle_event_timeout_ms,
                &eligible,
            )
            .await?;
        summary.claimed = claimed.len();

        if claimed.is_empty() {
            debug!(
                candidates = eligible.len(),
                "Pending entries were claimed elsewhere, nothing to replay"
            );
            return Ok(summary);
        }

        info!(
            count = claimed.len(),
            consumer = %identity.consumer_name,
            "Replaying claimed pending events"
        );

        // Same shape as a fresh read, so replays go through the same parsing
        let reply = ReadReply::single(identity.stream_name.clone(), claimed);
        let batch = EventBatch::from_reply(reply, &identity.stream_name);
        summary.redelivered = dispatch_batch(self.store.as_ref(), identity, hooks, &batch).await?;

        Ok(summary)
    }

    /// Delivered more often than the replay budget allows
    fn is_poison(&self, entry: &PendingEntry) -> bool {
        entry.delivery_count > self.event_maximum_replays
    }

    /// Acknowledge a poison event, copying it to the dead-letter stream first
    async fn evict(&self, entry: &PendingEntry, summary: &mut ReclaimSummary) -> Result<()> {
        let identity = &self.identity;

        warn!(
            event_id = %entry.event_id,
            owner = %entry.consumer_name,
            delivery_count = entry.delivery_count,
            max_replays = self.event_maximum_replays,
            "Evicting poison event"
        );

        if let Some(dead_letter_stream) = &self.dead_letter_stream {
            let source = self
                .store
                .fetch(&identity.stream_name, &entry.event_id)
                .await?;

            match source {
                Some(raw) => {
                    let fields = dead_letter_fields(&identity.stream_name, entry, raw);
                    match self.store.append(dead_letter_stream, &fields).await {
                        Ok(dead_letter_id) => {
                            info!(
                                event_id = %entry.event_id,
                                dead_letter_stream = %dead_letter_stream,
                                dead_letter_id = %dead_letter_id,
                                "Moved poison event to dead-letter stream"
                            );
                            summary.dead_lettered.push(entry.event_id.clone());
                        }
                        Err(e) => {
                            warn!(
                                event_id = %entry.event_id,
                                error = %e,
                                "Dead-letter append failed, keeping event pending"
                            );
                            summary.deferred.push(entry.event_id.clone());
                            return Ok(());
                        }
                    }
                }
                None => {
                    debug!(
                        event_id = %entry.event_id,
                        "Poison event no longer in the stream, nothing to dead-letter"
                    );
                }
            }
        }

        self.store
            .ack(&identity.stream_name, &identity.group_name, &entry.event_id)
            .await?;
        summary.evicted.push(entry.event_id.clone());
        Ok(())
    }
}

/// Original fields followed by the eviction metadata
fn dead_letter_fields(stream: &str, entry: &PendingEntry, raw: RawEntry) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = raw
        .fields
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();

    fields.extend([
        (DEAD_LETTER_SOURCE_STREAM.to_string(), stream.to_string()),
        (DEAD_LETTER_ORIGINAL_ID.to_string(), entry.event_id.to_string()),
        (
            DEAD_LETTER_DELIVERY_COUNT.to_string(),
            entry.delivery_count.to_string(),
        ),
        (DEAD_LETTER_EVICTED_AT.to_string(), Utc::now().to_rfc3339()),
    ]);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::hooks::FnHooks;
    use crate::store::{GroupReadOptions, MemoryStreamStore};
    use crate::types::StartPosition;
    use std::time::Duration;

    const IDLE_MS: u64 = 1_000;

    fn failing() -> FnHooks {
        FnHooks::new(|_| Box::pin(async move { Ok(false) }))
    }

    fn accepting() -> FnHooks {
        FnHooks::new(|_| Box::pin(async move { Ok(true) }))
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig::new("s")
            .with_group_name("g")
            .with_idle_event_timeout_ms(IDLE_MS)
            .with_event_maximum_replays(2)
    }

    /// One event delivered to a consumer that never acknowledged it
    async fn abandoned_event(store: &MemoryStreamStore) -> EventId {
        store
            .create_group("s", "g", StartPosition::Latest, true)
            .await
            .unwrap();
        let id = store
            .append("s", &[("payload".to_string(), "x".to_string())])
            .await
            .unwrap();
        let options = GroupReadOptions::new("s", "g", "crashed").with_block_ms(5);
        store.group_read(&options).await.unwrap();
        id
    }

    fn reclaimer(store: &Arc<MemoryStreamStore>, config: &ConsumerConfig) -> PendingReclaimer<MemoryStreamStore> {
        PendingReclaimer::new(
            Arc::clone(store),
            ConsumerIdentity::new("s", "g", "rescuer"),
            config,
        )
    }

    #[tokio::test]
    async fn test_nothing_pending() {
        let store = Arc::new(MemoryStreamStore::new());
        store
            .create_group("s", "g", StartPosition::Latest, true)
            .await
            .unwrap();
        store.clear_calls();

        let summary = reclaimer(&store, &config())
            .process_pending_events(&accepting())
            .await
            .unwrap();

        assert_eq!(summary, ReclaimSummary::default());
        assert_eq!(store.calls(), vec!["list_pending"]);
    }

    #[tokio::test]
    async fn test_recent_entries_are_left_alone() {
        let store = Arc::new(MemoryStreamStore::new());
        abandoned_event(&store).await;

        let summary = reclaimer(&store, &config())
            .process_pending_events(&accepting())
            .await
            .unwrap();

        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.claimed, 0);
        assert!(!store.calls().contains(&"claim".to_string()));
        let pending = store.list_pending("s", "g", None, 10).await.unwrap();
        assert_eq!(pending[0].consumer_name, "crashed");
    }

    #[tokio::test]
    async fn test_idle_entries_are_claimed_and_replayed() {
        let store = Arc::new(MemoryStreamStore::new());
        let id = abandoned_event(&store).await;
        store.advance(Duration::from_millis(IDLE_MS + 1));

        let summary = reclaimer(&store, &config())
            .process_pending_events(&accepting())
            .await
            .unwrap();

        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.redelivered.acked, vec![id]);
        assert!(store.list_pending("s", "g", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_idle_entry_behind_a_full_scan_is_claimed() {
        let store = Arc::new(MemoryStreamStore::new());
        store
            .create_group("s", "g", StartPosition::Latest, true)
            .await
            .unwrap();
        let head = store
            .append("s", &[("payload".to_string(), "head".to_string())])
            .await
            .unwrap();
        let stuck = store
            .append("s", &[("payload".to_string(), "stuck".to_string())])
            .await
            .unwrap();
        let options = GroupReadOptions::new("s", "g", "crashed")
            .with_block_ms(5)
            .with_count(2);
        store.group_read(&options).await.unwrap();
        store.advance(Duration::from_millis(IDLE_MS + 1));
        // The head entry was just redelivered elsewhere, so it is not idle
        store
            .claim("s", "g", "other", 0, std::slice::from_ref(&head))
            .await
            .unwrap();

        let summary = reclaimer(&store, &config().with_pending_scan_limit(1))
            .process_pending_events(&accepting())
            .await
            .unwrap();

        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.redelivered.acked, vec![stuck]);
        let pending = store.list_pending("s", "g", None, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_id, head);
        assert_eq!(pending[0].consumer_name, "other");
    }

    #[tokio::test]
    async fn test_failed_replay_bumps_delivery_count() {
        let store = Arc::new(MemoryStreamStore::new());
        abandoned_event(&store).await;
        store.advance(Duration::from_millis(IDLE_MS + 1));

        let summary = reclaimer(&store, &config())
            .process_pending_events(&failing())
            .await
            .unwrap();

        assert_eq!(summary.redelivered.rejected.len(), 1);
        let pending = store.list_pending("s", "g", None, 10).await.unwrap();
        assert_eq!(pending[0].consumer_name, "rescuer");
        assert_eq!(pending[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_poison_event_is_evicted_not_deleted() {
        let store = Arc::new(MemoryStreamStore::new());
        let id = abandoned_event(&store).await;
        let reclaimer = reclaimer(&store, &config());

        // Deliveries 2 and 3 (max replays is 2)
        for _ in 0..2 {
            store.advance(Duration::from_millis(IDLE_MS + 1));
            reclaimer.process_pending_events(&failing()).await.unwrap();
        }
        let pending = store.list_pending("s", "g", None, 10).await.unwrap();
        assert_eq!(pending[0].delivery_count, 3);

        let summary = reclaimer.process_pending_events(&failing()).await.unwrap();

        assert_eq!(summary.evicted, vec![id]);
        assert_eq!(summary.claimed, 0);
        assert!(store.list_pending("s", "g", None, 10).await.unwrap().is_empty());
        assert_eq!(store.stream_len("s").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_copy() {
        let store = Arc::new(MemoryStreamStore::new());
        let id = abandoned_event(&store).await;
        let config = config()
            .with_event_maximum_replays(0)
            .with_dead_letter_stream("s:dead");

        let summary = reclaimer(&store, &config)
            .process_pending_events(&failing())
            .await
            .unwrap();

        assert_eq!(summary.evicted, vec![id.clone()]);
        assert_eq!(summary.dead_lettered, vec![id.clone()]);
        assert_eq!(store.stream_len("s:dead").await.unwrap(), 1);

        store
            .create_group("s:dead", "inspect", StartPosition::Beginning, false)
            .await
            .unwrap();
        let options = GroupReadOptions::new("s:dead", "inspect", "me").with_block_ms(5);
        let reply = store.group_read(&options).await.unwrap().unwrap();
        let batch = EventBatch::from_reply(reply, "s:dead");
        let copy = &batch.events()[0];
        assert_eq!(copy.field("payload"), Some("x"));
        assert_eq!(copy.field(DEAD_LETTER_SOURCE_STREAM), Some("s"));
        assert_eq!(copy.field(DEAD_LETTER_ORIGINAL_ID), Some(id.as_str()));
        assert_eq!(copy.field(DEAD_LETTER_DELIVERY_COUNT), Some("1"));
        assert!(copy.field(DEAD_LETTER_EVICTED_AT).is_some());
    }

    #[tokio::test]
    async fn test_deleted_poison_event_is_acked_without_copy() {
        let store = Arc::new(MemoryStreamStore::new());
        let id = abandoned_event(&store).await;
        store.delete("s", &id).await.unwrap();
        let config = config()
            .with_event_maximum_replays(0)
            .with_dead_letter_stream("s:dead");

        let summary = reclaimer(&store, &config)
            .process_pending_events(&failing())
            .await
            .unwrap();

        assert_eq!(summary.evicted, vec![id]);
        assert!(summary.dead_lettered.is_empty());
        assert_eq!(store.stream_len("s:dead").await.unwrap(), 0);
    }

    #[test]
    fn test_dead_letter_fields() {
        let entry = PendingEntry {
            event_id: EventId::from("5-1"),
            consumer_name: "c".to_string(),
            idle_ms: 0,
            delivery_count: 4,
        };
        let raw = RawEntry::new("5-1", vec!["a".into(), "1".into()]);

        let fields = dead_letter_fields("orders", &entry, raw);

        assert_eq!(fields[0], ("a".to_string(), "1".to_string()));
        assert_eq!(fields[1].1, "orders");
        assert_eq!(fields[2].1, "5-1");
        assert_eq!(fields[3].1, "4");
        assert_eq!(fields.len(), 5);
    }
}
