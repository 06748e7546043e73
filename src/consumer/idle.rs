use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::store::StreamStore;
use crate::types::{ConsumerIdentity, ConsumerInfo};

/// Removes consumers that stopped talking to the group
///
/// Every process start registers a fresh consumer name, so without reaping
/// the group's consumer list grows forever.
pub struct IdleReaper<S: StreamStore + ?Sized> {
    store: Arc<S>,
    identity: ConsumerIdentity,
    idle_consumer_timeout_ms: u64,
}

impl<S: StreamStore + ?Sized> IdleReaper<S> {
    pub fn new(store: Arc<S>, identity: ConsumerIdentity, idle_consumer_timeout_ms: u64) -> Self {
        Self {
            store,
            identity,
            idle_consumer_timeout_ms,
        }
    }

    /// Remove every consumer idle longer than the timeout that owns no
    /// pending entries. Returns the names removed.
    ///
    /// The listing is only a candidate set: the store refuses the removal
    /// of a consumer that picked up entries since, and it is kept.
    pub async fn remove_idle_consumers(&self) -> Result<Vec<String>> {
        let identity = &self.identity;
        let consumers = self
            .store
            .list_consumers(&identity.stream_name, &identity.group_name)
            .await?;

        let mut removed = Vec::new();
        for consumer in consumers
            .iter()
            .filter(|c| is_reapable(c, self.idle_consumer_timeout_ms, &identity.consumer_name))
        {
            let removed_now = self
                .store
                .remove_consumer(&identity.stream_name, &identity.group_name, &consumer.name)
                .await?;
            if !removed_now {
                debug!(
                    consumer = %consumer.name,
                    "Idle consumer owns pending entries again, keeping it"
                );
                continue;
            }

            info!(
                consumer = %consumer.name,
                idle_ms = consumer.idle_ms,
                "Removed idle consumer"
            );
            removed.push(consumer.name.clone());
        }

        Ok(removed)
    }
}

/// Idle past the timeout, owns nothing, and is not the caller
pub fn is_reapable(consumer: &ConsumerInfo, idle_timeout_ms: u64, own_name: &str) -> bool {
    consumer.name != own_name && consumer.pending == 0 && consumer.idle_ms > idle_timeout_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GroupReadOptions, MemoryStreamStore};
    use crate::types::StartPosition;
    use std::time::Duration;

    fn info(name: &str, pending: u64, idle_ms: u64) -> ConsumerInfo {
        ConsumerInfo {
            name: name.to_string(),
            pending,
            idle_ms,
        }
    }

    #[test]
    fn test_is_reapable() {
        assert!(is_reapable(&info("old", 0, 101), 100, "me"));
        assert!(!is_reapable(&info("old", 0, 100), 100, "me"));
        assert!(!is_reapable(&info("busy", 1, 1_000_000), 100, "me"));
        assert!(!is_reapable(&info("me", 0, 1_000_000), 100, "me"));
    }

    #[tokio::test]
    async fn test_removes_only_idle_consumers_without_pending() {
        let store = Arc::new(MemoryStreamStore::new());
        store
            .create_group("s", "g", StartPosition::Latest, true)
            .await
            .unwrap();
        store
            .append("s", &[("k".to_string(), "v".to_string())])
            .await
            .unwrap();
        for name in ["owner", "stale", "me"] {
            let options = GroupReadOptions::new("s", "g", name).with_block_ms(5);
            store.group_read(&options).await.unwrap();
        }
        store.advance(Duration::from_secs(120));

        let reaper = IdleReaper::new(
            Arc::clone(&store),
            ConsumerIdentity::new("s", "g", "me"),
            60_000,
        );
        let removed = reaper.remove_idle_consumers().await.unwrap();

        assert_eq!(removed, vec!["stale"]);
        let remaining: Vec<String> = store
            .list_consumers("s", "g")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(remaining, vec!["me", "owner"]);
    }

    #[tokio::test]
    async fn test_consumer_that_takes_entries_after_listing_is_kept() {
        let store = Arc::new(MemoryStreamStore::new());
        store
            .create_group("s", "g", StartPosition::Latest, true)
            .await
            .unwrap();
        let options = GroupReadOptions::new("s", "g", "late").with_block_ms(5);
        store.group_read(&options).await.unwrap();
        let id = store
            .append("s", &[("k".to_string(), "v".to_string())])
            .await
            .unwrap();
        store.advance(Duration::from_secs(120));

        // "late" is listed idle with nothing pending, then reads before the removal
        store.before_next_call("remove_consumer", move |store| {
            assert_eq!(store.deliver_now(&options).unwrap(), 1);
        });

        let reaper = IdleReaper::new(
            Arc::clone(&store),
            ConsumerIdentity::new("s", "g", "me"),
            60_000,
        );
        let removed = reaper.remove_idle_consumers().await.unwrap();

        assert!(removed.is_empty());
        assert!(store.calls().contains(&"remove_consumer".to_string()));
        let consumers = store.list_consumers("s", "g").await.unwrap();
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0].name, "late");
        assert_eq!(consumers[0].pending, 1);
        let pending = store.list_pending("s", "g", None, 10).await.unwrap();
        assert_eq!(pending[0].event_id, id);
        assert_eq!(pending[0].consumer_name, "late");
    }

    #[tokio::test]
    async fn test_no_mutation_when_nothing_is_idle() {
        let store = Arc::new(MemoryStreamStore::new());
        store
            .create_group("s", "g", StartPosition::Latest, true)
            .await
            .unwrap();
        let options = GroupReadOptions::new("s", "g", "fresh").with_block_ms(5);
        store.group_read(&options).await.unwrap();
        store.clear_calls();

        let reaper = IdleReaper::new(
            Arc::clone(&store),
            ConsumerIdentity::new("s", "g", "me"),
            60_000,
        );
        assert!(reaper.remove_idle_consumers().await.unwrap().is_empty());
        assert_eq!(store.calls(), vec!["list_consumers"]);
    }
}
