//! Consumer module: reliable group consumption
//!
//! This module provides:
//! - `Consumer`: the read → dispatch → acknowledge engine
//! - `ConsumerHooks`: extension points (`on_event`, `init`, batch hooks)
//! - `PendingReclaimer`: replays or evicts stuck pending entries
//! - `IdleReaper`: removes dead consumers from the group
//!
//! # Cycle
//!
//! 1. **Read**: block up to `wait_time_ms` for at most `batch_size` new events
//! 2. **Dispatch**: hand events to `on_event` one at a time, in order
//! 3. **Acknowledge**: successes only; failures stay pending
//! 4. **Housekeeping** (when the read times out): `on_batches_complete`,
//!    then pending entries, then idle consumers
//! 5. **Repeat**, reconnecting after any store failure
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use redstream::config::ConsumerConfig;
//! use redstream::consumer::{Consumer, NoopHooks};
//! use redstream::store::{MemoryStreamStore, StreamStore};
//! use redstream::types::StartPosition;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStreamStore::new());
//!     store.append("orders", &[("type".into(), "Placed".into())]).await?;
//!
//!     let config = ConsumerConfig::new("orders")
//!         .with_start_position(StartPosition::Beginning)
//!         .with_wait_time_ms(10)
//!         .with_run_once(true);
//!
//!     let mut consumer = Consumer::new(Arc::clone(&store), config, NoopHooks);
//!     consumer.start().await?;
//!
//!     assert_eq!(consumer.stats().events_acked, 1);
//!     Ok(())
//! }
//! ```
//!
//! # Replay budget
//!
//! An event whose handler keeps failing is claimed and redelivered once it
//! has been idle for `idle_event_timeout_ms`. When its delivery count exceeds
//! `event_maximum_replays` it is acknowledged without redelivery (and copied
//! to `dead_letter_stream` when one is configured). The event itself stays in
//! the stream.

pub mod dispatch;
pub mod engine;
pub mod hooks;
pub mod idle;
pub mod naming;
pub mod pending;

pub use dispatch::{dispatch_batch, DispatchSummary};
pub use engine::{ConnectionState, Consumer, ConsumerStats, CycleOutcome};
pub use hooks::{ConsumerHooks, EventHandler, FnHooks, NoopHooks};
pub use idle::IdleReaper;
pub use naming::generate_consumer_name;
pub use pending::{PendingReclaimer, ReclaimSummary};
