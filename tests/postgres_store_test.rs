//! PostgreSQL backend tests
//!
//! These start a PostgreSQL container, so they need Docker:
//! `cargo test --test postgres_store_test -- --ignored`

mod common;

use common::{append_named, assert_store_contract, test_config, RecordingHooks};
use redstream::consumer::Consumer;
use redstream::store::{PostgresStoreConfig, PostgresStreamStore, StreamStore};
use std::sync::Arc;
use testcontainers::clients::Cli;

async fn connected_store(port: u16, schema: &str) -> Arc<PostgresStreamStore> {
    let connection_string = common::build_postgres_connection_string("127.0.0.1", port);
    let config = PostgresStoreConfig::from_connection_string(&connection_string)
        .expect("Failed to create config from connection string")
        .with_schema_name(schema)
        .with_poll_interval_ms(10);

    let store = Arc::new(PostgresStreamStore::new(config));
    store.connect().await.expect("Failed to connect to PostgreSQL");
    store
}

#[tokio::test]
async fn test_invalid_connection_string() {
    let result = PostgresStoreConfig::from_connection_string("invalid://connection/string");
    assert!(result.is_err(), "Should fail with invalid connection string");
}

#[tokio::test]
async fn test_calls_before_connect_fail() {
    let store = PostgresStreamStore::new(PostgresStoreConfig::default());
    let err = store.stream_len("orders").await.unwrap_err();
    assert!(err.is_connection());
}

#[tokio::test]
#[ignore] // Run with --ignored flag
async fn test_store_contract() {
    let docker = Cli::default();
    let container = docker.run(common::create_postgres_container());
    let store = connected_store(container.get_host_port_ipv4(common::POSTGRES_PORT), "contract").await;

    assert_store_contract(store.as_ref(), "contract").await;
}

#[tokio::test]
#[ignore] // Run with --ignored flag
async fn test_connect_twice_keeps_schema() {
    let docker = Cli::default();
    let container = docker.run(common::create_postgres_container());
    let store = connected_store(container.get_host_port_ipv4(common::POSTGRES_PORT), "twice").await;

    append_named(store.as_ref(), "orders", "a").await;
    store.connect().await.expect("Reconnect should succeed");

    assert_eq!(store.stream_len("orders").await.unwrap(), 1);
}

#[tokio::test]
#[ignore] // Run with --ignored flag
async fn test_competing_consumers_split_the_stream() {
    let docker = Cli::default();
    let container = docker.run(common::create_postgres_container());
    let store = connected_store(container.get_host_port_ipv4(common::POSTGRES_PORT), "competing").await;

    for n in 0..10 {
        append_named(store.as_ref(), "orders", &format!("e{}", n)).await;
    }

    let mut first = Consumer::new(
        Arc::clone(&store),
        test_config("orders").with_consumer_name("first").with_batch_size(3),
        RecordingHooks::default(),
    );
    let mut second = Consumer::new(
        Arc::clone(&store),
        test_config("orders").with_consumer_name("second").with_batch_size(3),
        RecordingHooks::default(),
    );

    tokio::join!(
        async {
            for _ in 0..3 {
                first.start().await.unwrap();
            }
        },
        async {
            for _ in 0..3 {
                second.start().await.unwrap();
            }
        }
    );

    let mut all = first.hooks().seen();
    all.extend(second.hooks().seen());
    all.sort();
    all.dedup();
    let total = first.hooks().seen().len() + second.hooks().seen().len();
    assert_eq!(total, all.len(), "an event was delivered twice");
    assert!(store.list_pending("orders", "g", None, 20).await.unwrap().is_empty());
}
