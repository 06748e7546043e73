use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::dispatch::{dispatch_batch, DispatchSummary};
use super::hooks::ConsumerHooks;
use super::idle::IdleReaper;
use super::naming::generate_consumer_name;
use super::pending::{PendingReclaimer, ReclaimSummary};
use crate::batch::EventBatch;
use crate::config::ConsumerConfig;
use crate::error::{Error, Result};
use crate::store::{GroupReadOptions, StreamStore};
use crate::types::{ConsumerIdentity, GroupCreation};

/// Where the consumer is in its connection lifecycle
///
/// `Disconnected → Connecting → Initializing → Polling`; any failed store
/// call sends it back to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Initializing,
    Polling,
}

/// What one cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// New events were read and dispatched
    Batch(DispatchSummary),

    /// The read timed out; pending entries and idle consumers were handled
    Housekeeping {
        reclaim: ReclaimSummary,
        removed_consumers: Vec<String>,
    },
}

/// Running counters of a consumer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub cycles: u64,
    pub batches: u64,
    pub events_received: u64,
    pub events_acked: u64,
    pub events_failed: u64,
    pub events_skipped: u64,
    pub events_redelivered: u64,
    pub events_evicted: u64,
    pub events_dead_lettered: u64,
    pub consumers_removed: u64,
    pub reconnects: u64,
}

impl ConsumerStats {
    fn record_dispatch(&mut self, summary: &DispatchSummary) {
        self.events_acked += summary.acked.len() as u64;
        self.events_failed += summary.failed() as u64;
        self.events_skipped += summary.skipped as u64;
    }
}

/// Reliable consumer of a stream through a consumer group
///
/// Runs the read → dispatch → acknowledge cycle. When a read times out the
/// cycle does housekeeping instead: stuck pending entries are replayed or
/// evicted, and idle consumers are removed from the group. Store failures
/// never escape [`Consumer::start`]; the consumer disconnects, reconnects,
/// re-creates the group and carries on.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use redstream::config::ConsumerConfig;
/// use redstream::consumer::{Consumer, FnHooks};
/// use redstream::store::{RedisStoreConfig, RedisStreamStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = Arc::new(RedisStreamStore::new(RedisStoreConfig::new("redis://localhost:6379")));
///     let config = ConsumerConfig::new("orders").with_group_name("billing");
///
///     let hooks = FnHooks::new(|event| Box::pin(async move {
///         println!("{}: {:?}", event.id(), event.fields());
///         Ok(true)
///     }));
///
///     let mut consumer = Consumer::new(store, config, hooks);
///     consumer.start().await?;
///     Ok(())
/// }
/// ```
pub struct Consumer<S: StreamStore + ?Sized, H: ConsumerHooks> {
    store: Arc<S>,
    config: ConsumerConfig,
    identity: ConsumerIdentity,
    hooks: H,
    reclaimer: PendingReclaimer<S>,
    reaper: IdleReaper<S>,
    state: ConnectionState,
    stats: ConsumerStats,
    connected_before: bool,
}

impl<S: StreamStore + ?Sized, H: ConsumerHooks> Consumer<S, H> {
    /// Create a consumer. Nothing touches the store until the first cycle.
    ///
    /// A consumer name is generated when the configuration has none.
    pub fn new(store: Arc<S>, config: ConsumerConfig, hooks: H) -> Self {
        let consumer_name = config
            .consumer_name
            .clone()
            .unwrap_or_else(|| generate_consumer_name(&config.group_name));
        let identity = ConsumerIdentity::new(
            config.stream_name.clone(),
            config.group_name.clone(),
            consumer_name,
        );

        let reclaimer = PendingReclaimer::new(Arc::clone(&store), identity.clone(), &config);
        let reaper = IdleReaper::new(
            Arc::clone(&store),
            identity.clone(),
            config.idle_consumer_timeout_ms,
        );

        Self {
            store,
            config,
            identity,
            hooks,
            reclaimer,
            reaper,
            state: ConnectionState::Disconnected,
            stats: ConsumerStats::default(),
            connected_before: false,
        }
    }

    /// Run until the process stops, or for one successful cycle with `run_once`
    ///
    /// Only configuration errors are returned, and they are returned before
    /// any store call. Everything else is logged and recovered from.
    pub async fn start(&mut self) -> Result<()> {
        self.config.validate()?;

        info!(
            stream = %self.identity.stream_name,
            group = %self.identity.group_name,
            consumer = %self.identity.consumer_name,
            "Starting consumer"
        );

        loop {
            match self.run_cycle().await {
                Ok(_) if self.config.run_once => return Ok(()),
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Consumer stopped");
                    return Err(e);
                }
                Err(_) => {
                    time::sleep(Duration::from_millis(self.config.reconnect_delay_ms)).await;
                }
            }
        }
    }

    /// Run a single cycle
    ///
    /// Connects and initializes first if needed. On failure the store is
    /// disconnected and the next cycle starts over from
    /// [`ConnectionState::Disconnected`].
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        match self.try_cycle().await {
            Ok(outcome) => {
                self.stats.cycles += 1;
                Ok(outcome)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(
                    error = %e,
                    state = ?self.state,
                    "Stream store connection lost, resetting connection"
                );
                info!("Disconnecting");
                self.store.disconnect().await;
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn try_cycle(&mut self) -> Result<CycleOutcome> {
        self.ensure_ready().await?;

        let options = GroupReadOptions::new(
            self.identity.stream_name.clone(),
            self.identity.group_name.clone(),
            self.identity.consumer_name.clone(),
        )
        .with_block_ms(self.config.wait_time_ms)
        .with_count(self.config.batch_size);

        match self.store.group_read(&options).await? {
            Some(reply) if !reply.is_empty() => {
                let batch = EventBatch::from_reply(reply, &self.identity.stream_name);
                self.on_batch(batch).await
            }
            _ => self.on_batches_complete().await,
        }
    }

    /// Connect and initialize unless already polling
    async fn ensure_ready(&mut self) -> Result<()> {
        if self.state == ConnectionState::Polling {
            return Ok(());
        }
        self.config.validate()?;

        self.state = ConnectionState::Connecting;
        info!("Connecting");
        self.store.connect().await?;
        if self.connected_before {
            self.stats.reconnects += 1;
        }
        self.connected_before = true;

        self.state = ConnectionState::Initializing;
        info!("Initializing");
        self.initialize().await?;

        self.state = ConnectionState::Polling;
        info!(consumer = %self.identity.consumer_name, "Consumer ready");
        Ok(())
    }

    /// Make sure the group exists, then run the user `init` hook
    async fn initialize(&mut self) -> Result<()> {
        let creation = self
            .store
            .create_group(
                &self.identity.stream_name,
                &self.identity.group_name,
                self.config.start_position,
                self.config.create_stream_if_missing,
            )
            .await?;

        match creation {
            GroupCreation::Created => {
                info!(group = %self.identity.group_name, "Created consumer group")
            }
            GroupCreation::AlreadyExists => {
                info!(group = %self.identity.group_name, "Found existing consumer group")
            }
        }

        self.hooks
            .init()
            .await
            .map_err(|e| Error::Initialization(e.to_string()))
    }

    async fn on_batch(&mut self, batch: EventBatch) -> Result<CycleOutcome> {
        debug!(events = batch.len(), skipped = batch.skipped().len(), "Received batch");

        let summary =
            dispatch_batch(self.store.as_ref(), &self.identity, &self.hooks, &batch).await?;

        self.stats.batches += 1;
        self.stats.events_received += batch.len() as u64;
        self.stats.record_dispatch(&summary);

        if let Err(e) = self.hooks.on_batch_complete().await {
            warn!(error = %e, "on_batch_complete hook failed");
        }

        Ok(CycleOutcome::Batch(summary))
    }

    /// End of cycle: user hook, then pending entries, then idle consumers
    async fn on_batches_complete(&mut self) -> Result<CycleOutcome> {
        if let Err(e) = self.hooks.on_batches_complete().await {
            warn!(error = %e, "on_batches_complete hook failed");
        }

        let reclaim = self.reclaimer.process_pending_events(&self.hooks).await?;
        let removed_consumers = self.reaper.remove_idle_consumers().await?;

        self.stats.events_redelivered += reclaim.claimed as u64;
        self.stats.events_evicted += reclaim.evicted.len() as u64;
        self.stats.events_dead_lettered += reclaim.dead_lettered.len() as u64;
        self.stats.record_dispatch(&reclaim.redelivered);
        self.stats.consumers_removed += removed_consumers.len() as u64;

        Ok(CycleOutcome::Housekeeping {
            reclaim,
            removed_consumers,
        })
    }

    pub fn identity(&self) -> &ConsumerIdentity {
        &self.identity
    }

    /// Name this consumer registers under in the group
    pub fn consumer_name(&self) -> &str {
        &self.identity.consumer_name
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }
}
