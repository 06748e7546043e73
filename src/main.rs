//! `redstream-worker`: consume a stream and log every event
//!
//! Configured through the environment (a `.env` file is loaded first):
//!
//! - `REDSTREAM_BACKEND`: `redis` (default) or `postgres`
//! - `REDSTREAM_URL`: Redis URL or PostgreSQL connection string
//! - `REDSTREAM_*`: consumer settings, see `ConsumerConfig::from_env`
//! - `RUST_LOG`: log filter (default `info`)

use async_trait::async_trait;
use std::env;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use redstream::store::{
    PostgresStoreConfig, PostgresStreamStore, RedisStoreConfig, RedisStreamStore, StreamStore,
};
use redstream::{Consumer, ConsumerConfig, ConsumerHooks, Error, Event, HandlerError};

struct LoggingHandler;

#[async_trait]
impl ConsumerHooks for LoggingHandler {
    async fn init(&self) -> Result<(), HandlerError> {
        info!("Worker initialized");
        Ok(())
    }

    async fn on_event(&self, event: &Event) -> Result<bool, HandlerError> {
        info!(event_id = %event.id(), fields = %event.to_json(), "Received event");
        Ok(true)
    }

    async fn on_batches_complete(&self) -> Result<(), HandlerError> {
        debug!("No new events");
        Ok(())
    }
}

fn build_store() -> redstream::Result<Arc<dyn StreamStore>> {
    let backend = env::var("REDSTREAM_BACKEND").unwrap_or_else(|_| "redis".to_string());
    let url = env::var("REDSTREAM_URL").ok();

    let store: Arc<dyn StreamStore> = match backend.as_str() {
        "redis" => {
            let config = url.map(RedisStoreConfig::new).unwrap_or_default();
            Arc::new(RedisStreamStore::new(config))
        }
        "postgres" => {
            let config = match url {
                Some(url) => PostgresStoreConfig::from_connection_string(&url)?,
                None => PostgresStoreConfig::default(),
            };
            Arc::new(PostgresStreamStore::new(config))
        }
        other => {
            return Err(Error::Config(format!(
                "REDSTREAM_BACKEND must be 'redis' or 'postgres', got '{}'",
                other
            )))
        }
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ConsumerConfig::from_env()?;
    let store = build_store()?;

    let mut consumer = Consumer::new(store, config, LoggingHandler);
    info!(consumer = %consumer.consumer_name(), "redstream worker starting");
    consumer.start().await?;

    info!(
        stats = %serde_json::to_string(consumer.stats())?,
        "redstream worker stopped"
    );
    Ok(())
}
