//! Reliable consumer groups for append-only event streams
//!
//! `redstream` reads a stream through a consumer group and guarantees
//! at-least-once delivery to a handler: events are acknowledged only after
//! the handler accepts them, stuck events are claimed and replayed a bounded
//! number of times, and consumers that died are removed from the group.
//!
//! The stream itself lives behind the [`store::StreamStore`] trait, with
//! Redis Streams, PostgreSQL and in-memory backends.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use redstream::{Consumer, ConsumerConfig, FnHooks};
//! use redstream::store::{RedisStoreConfig, RedisStreamStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(RedisStreamStore::new(RedisStoreConfig::new("redis://localhost:6379")));
//!
//!     let hooks = FnHooks::new(|event| Box::pin(async move {
//!         println!("{}", event.to_json());
//!         Ok(true)
//!     }));
//!
//!     let mut consumer = Consumer::new(store, ConsumerConfig::from_env()?, hooks);
//!     consumer.start().await?;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod consumer;
pub mod error;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use batch::EventBatch;
pub use config::ConsumerConfig;
pub use consumer::{Consumer, ConsumerHooks, FnHooks, NoopHooks};
pub use error::{Error, HandlerError, Result};
pub use store::StreamStore;
pub use types::{Event, EventId};
