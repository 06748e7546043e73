use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::StartPosition;

pub const DEFAULT_STREAM_NAME: &str = "redstream";
pub const DEFAULT_GROUP_NAME: &str = "consumerGroup";
pub const DEFAULT_WAIT_TIME_MS: u64 = 2_000;
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_IDLE_EVENT_TIMEOUT_MS: u64 = 600_000;
pub const DEFAULT_IDLE_CONSUMER_TIMEOUT_MS: u64 = 5_400_000;
pub const DEFAULT_EVENT_MAXIMUM_REPLAYS: u64 = 3;
pub const DEFAULT_PENDING_SCAN_LIMIT: usize = 100;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;

/// Prefix of the environment variables read by [`ConsumerConfig::from_env`]
pub const ENV_PREFIX: &str = "REDSTREAM_";

/// Configuration for a consumer
///
/// Immutable once the consumer starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Stream to consume from
    pub stream_name: String,

    /// Consumer group name
    pub group_name: String,

    /// Name of this consumer inside the group (generated when unset)
    pub consumer_name: Option<String>,

    /// How long a group read blocks when no new events are available (milliseconds)
    pub wait_time_ms: u64,

    /// Maximum events per group read
    pub batch_size: usize,

    /// Pending entries idle longer than this may be claimed by another consumer (milliseconds)
    pub idle_event_timeout_ms: u64,

    /// Consumers idle longer than this are removed from the group (milliseconds)
    pub idle_consumer_timeout_ms: u64,

    /// Pending entries delivered more often than this are evicted
    pub event_maximum_replays: u64,

    /// Stop after one full cycle
    pub run_once: bool,

    /// Where a newly created group starts reading
    pub start_position: StartPosition,

    /// Create the stream when creating the group if it does not exist yet
    pub create_stream_if_missing: bool,

    /// Maximum pending entries inspected per reclaim cycle
    pub pending_scan_limit: usize,

    /// Pause after a failed cycle before reconnecting (milliseconds)
    pub reconnect_delay_ms: u64,

    /// Evicted events are copied here before being acknowledged
    pub dead_letter_stream: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            group_name: DEFAULT_GROUP_NAME.to_string(),
            consumer_name: None,
            wait_time_ms: DEFAULT_WAIT_TIME_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            idle_event_timeout_ms: DEFAULT_IDLE_EVENT_TIMEOUT_MS,
            idle_consumer_timeout_ms: DEFAULT_IDLE_CONSUMER_TIMEOUT_MS,
            event_maximum_replays: DEFAULT_EVENT_MAXIMUM_REPLAYS,
            run_once: false,
            start_position: StartPosition::Latest,
            create_stream_if_missing: true,
            pending_scan_limit: DEFAULT_PENDING_SCAN_LIMIT,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            dead_letter_stream: None,
        }
    }
}

impl ConsumerConfig {
    /// Create a new configuration for a stream, with defaults for everything else
    ///
    /// # Example
    ///
    /// ```
    /// use redstream::config::ConsumerConfig;
    ///
    /// let config = ConsumerConfig::new("orders")
    ///     .with_group_name("billing")
    ///     .with_batch_size(10)
    ///     .with_wait_time_ms(500)
    ///     .with_event_maximum_replays(5);
    ///
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            ..Default::default()
        }
    }

    /// Set the consumer group name (builder pattern)
    pub fn with_group_name(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = group_name.into();
        self
    }

    /// Set a fixed consumer name (builder pattern)
    pub fn with_consumer_name(mut self, consumer_name: impl Into<String>) -> Self {
        self.consumer_name = Some(consumer_name.into());
        self
    }

    /// Set the blocking read duration in milliseconds (builder pattern)
    pub fn with_wait_time_ms(mut self, wait_time_ms: u64) -> Self {
        self.wait_time_ms = wait_time_ms;
        self
    }

    /// Set the batch size (builder pattern)
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the idle-event timeout in milliseconds (builder pattern)
    pub fn with_idle_event_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.idle_event_timeout_ms = timeout_ms;
        self
    }

    /// Set the idle-consumer timeout in milliseconds (builder pattern)
    pub fn with_idle_consumer_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.idle_consumer_timeout_ms = timeout_ms;
        self
    }

    /// Set the maximum replay count (builder pattern)
    pub fn with_event_maximum_replays(mut self, replays: u64) -> Self {
        self.event_maximum_replays = replays;
        self
    }

    /// Stop after one cycle (builder pattern)
    pub fn with_run_once(mut self, run_once: bool) -> Self {
        self.run_once = run_once;
        self
    }

    /// Set the group start position (builder pattern)
    pub fn with_start_position(mut self, start_position: StartPosition) -> Self {
        self.start_position = start_position;
        self
    }

    /// Set whether group creation may create the stream (builder pattern)
    pub fn with_create_stream_if_missing(mut self, create: bool) -> Self {
        self.create_stream_if_missing = create;
        self
    }

    /// Set the pending scan limit (builder pattern)
    pub fn with_pending_scan_limit(mut self, limit: usize) -> Self {
        self.pending_scan_limit = limit;
        self
    }

    /// Set the reconnect delay in milliseconds (builder pattern)
    pub fn with_reconnect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    /// Set the dead-letter stream (builder pattern)
    pub fn with_dead_letter_stream(mut self, stream: impl Into<String>) -> Self {
        self.dead_letter_stream = Some(stream.into());
        self
    }

    /// Load configuration from `REDSTREAM_*` environment variables
    ///
    /// Unset variables keep their defaults:
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `REDSTREAM_STREAM_NAME` | `stream_name` |
    /// | `REDSTREAM_GROUP_NAME` | `group_name` |
    /// | `REDSTREAM_CONSUMER_NAME` | `consumer_name` |
    /// | `REDSTREAM_WAIT_TIME_MS` | `wait_time_ms` |
    /// | `REDSTREAM_BATCH_SIZE` | `batch_size` |
    /// | `REDSTREAM_IDLE_EVENT_TIMEOUT_MS` | `idle_event_timeout_ms` |
    /// | `REDSTREAM_IDLE_CONSUMER_TIMEOUT_MS` | `idle_consumer_timeout_ms` |
    /// | `REDSTREAM_EVENT_MAXIMUM_REPLAYS` | `event_maximum_replays` |
    /// | `REDSTREAM_RUN_ONCE` | `run_once` |
    /// | `REDSTREAM_START_POSITION` | `start_position` (`latest` or `beginning`) |
    /// | `REDSTREAM_CREATE_STREAM_IF_MISSING` | `create_stream_if_missing` |
    /// | `REDSTREAM_PENDING_SCAN_LIMIT` | `pending_scan_limit` |
    /// | `REDSTREAM_RECONNECT_DELAY_MS` | `reconnect_delay_ms` |
    /// | `REDSTREAM_DEAD_LETTER_STREAM` | `dead_letter_stream` |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    ///
    /// `lookup` receives full variable names (`REDSTREAM_BATCH_SIZE`, ...).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = Self::default();

        if let Some(value) = get("STREAM_NAME") {
            config.stream_name = value;
        }
        if let Some(value) = get("GROUP_NAME") {
            config.group_name = value;
        }
        if let Some(value) = get("CONSUMER_NAME") {
            config.consumer_name = Some(value);
        }
        if let Some(value) = get("WAIT_TIME_MS") {
            config.wait_time_ms = parse_number("WAIT_TIME_MS", &value)?;
        }
        if let Some(value) = get("BATCH_SIZE") {
            config.batch_size = parse_number("BATCH_SIZE", &value)?;
        }
        if let Some(value) = get("IDLE_EVENT_TIMEOUT_MS") {
            config.idle_event_timeout_ms = parse_number("IDLE_EVENT_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = get("IDLE_CONSUMER_TIMEOUT_MS") {
            config.idle_consumer_timeout_ms = parse_number("IDLE_CONSUMER_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = get("EVENT_MAXIMUM_REPLAYS") {
            config.event_maximum_replays = parse_number("EVENT_MAXIMUM_REPLAYS", &value)?;
        }
        if let Some(value) = get("RUN_ONCE") {
            config.run_once = parse_bool("RUN_ONCE", &value)?;
        }
        if let Some(value) = get("START_POSITION") {
            config.start_position = match value.to_ascii_lowercase().as_str() {
                "latest" | "$" => StartPosition::Latest,
                "beginning" | "0" => StartPosition::Beginning,
                other => {
                    return Err(Error::Config(format!(
                        "{}START_POSITION must be 'latest' or 'beginning', got '{}'",
                        ENV_PREFIX, other
                    )))
                }
            };
        }
        if let Some(value) = get("CREATE_STREAM_IF_MISSING") {
            config.create_stream_if_missing = parse_bool("CREATE_STREAM_IF_MISSING", &value)?;
        }
        if let Some(value) = get("PENDING_SCAN_LIMIT") {
            config.pending_scan_limit = parse_number("PENDING_SCAN_LIMIT", &value)?;
        }
        if let Some(value) = get("RECONNECT_DELAY_MS") {
            config.reconnect_delay_ms = parse_number("RECONNECT_DELAY_MS", &value)?;
        }
        if let Some(value) = get("DEAD_LETTER_STREAM") {
            config.dead_letter_stream = Some(value);
        }

        Ok(config)
    }

    /// Check the configuration before any store call is made
    pub fn validate(&self) -> Result<()> {
        if self.stream_name.trim().is_empty() {
            return Err(Error::Config(
                "consumer requires a stream to be configured".to_string(),
            ));
        }
        if self.group_name.trim().is_empty() {
            return Err(Error::Config("consumer group name must not be empty".to_string()));
        }
        if let Some(name) = &self.consumer_name {
            if name.trim().is_empty() {
                return Err(Error::Config("consumer name must not be empty".to_string()));
            }
        }
        if self.wait_time_ms == 0 {
            return Err(Error::Config("wait_time_ms must be greater than zero".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than zero".to_string()));
        }
        if self.pending_scan_limit == 0 {
            return Err(Error::Config(
                "pending_scan_limit must be greater than zero".to_string(),
            ));
        }
        if let Some(dead_letter) = &self.dead_letter_stream {
            if dead_letter.trim().is_empty() || *dead_letter == self.stream_name {
                return Err(Error::Config(
                    "dead_letter_stream must be a different, non-empty stream".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| {
        Error::Config(format!(
            "{}{} must be a non-negative integer, got '{}'",
            ENV_PREFIX, name, value
        ))
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "{}{} must be a boolean, got '{}'",
            ENV_PREFIX, name, value
        ))),
    }
}
