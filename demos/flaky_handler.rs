//! A handler that fails some events, run against the in-memory store
//!
//! Shows replays of failed events and the eviction of an event that never
//! succeeds. Run with:
//!
//! ```text
//! RUST_LOG=info cargo run --example flaky_handler
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use redstream::consumer::CycleOutcome;
use redstream::store::{MemoryStreamStore, StreamStore};
use redstream::types::StartPosition;
use redstream::{Consumer, ConsumerConfig, ConsumerHooks, Event, HandlerError};

const IDLE_EVENT_TIMEOUT_MS: u64 = 1_000;

/// Fails the first attempt of every order, and every attempt of "poison"
#[derive(Default)]
struct FlakyHandler {
    attempts: Mutex<HashMap<String, u32>>,
}

#[async_trait]
impl ConsumerHooks for FlakyHandler {
    async fn on_event(&self, event: &Event) -> Result<bool, HandlerError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
            let attempt = attempts.entry(event.id().to_string()).or_insert(0);
            *attempt += 1;
            *attempt
        };

        let order = event.field("order").unwrap_or_default();
        info!(event_id = %event.id(), order, attempt, "Handling order");

        if order == "poison" {
            return Err(format!("order {} can never be processed", order).into());
        }
        Ok(attempt > 1)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let store = Arc::new(MemoryStreamStore::new());
    for order in ["A-100", "poison", "A-101"] {
        store
            .append("orders", &[("order".to_string(), order.to_string())])
            .await?;
    }

    let config = ConsumerConfig::new("orders")
        .with_group_name("fulfilment")
        .with_start_position(StartPosition::Beginning)
        .with_wait_time_ms(50)
        .with_idle_event_timeout_ms(IDLE_EVENT_TIMEOUT_MS)
        .with_event_maximum_replays(2)
        .with_dead_letter_stream("orders:dead");

    let mut consumer = Consumer::new(Arc::clone(&store), config, FlakyHandler::default());

    for _ in 0..8 {
        match consumer.run_cycle().await? {
            CycleOutcome::Batch(summary) => {
                info!(acked = summary.acked.len(), failed = summary.failed(), "Batch done")
            }
            CycleOutcome::Housekeeping { reclaim, .. } => info!(
                replayed = reclaim.claimed,
                evicted = reclaim.evicted.len(),
                "Housekeeping done"
            ),
        }
        // Let pending entries go idle without waiting for real
        store.advance(Duration::from_millis(IDLE_EVENT_TIMEOUT_MS + 1));
    }

    info!(
        stats = %serde_json::to_string_pretty(consumer.stats())?,
        dead_letters = store.stream_len("orders:dead").await?,
        "Finished"
    );
    Ok(())
}
