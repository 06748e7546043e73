use serde::{Deserialize, Serialize};

use super::event::EventId;

/// Where a newly created group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    /// Only events appended after the group was created (`$`)
    #[default]
    Latest,

    /// Every event still in the stream (`0`)
    Beginning,
}

impl StartPosition {
    /// The Redis spelling of the position
    pub fn as_redis_id(&self) -> &'static str {
        match self {
            StartPosition::Latest => "$",
            StartPosition::Beginning => "0",
        }
    }
}

/// Outcome of an idempotent group creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

/// The name a consumer registers under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerIdentity {
    pub stream_name: String,
    pub group_name: String,
    pub consumer_name: String,
}

impl ConsumerIdentity {
    pub fn new(
        stream_name: impl Into<String>,
        group_name: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> Self {
        Self {
            stream_name: stream_name.into(),
            group_name: group_name.into(),
            consumer_name: consumer_name.into(),
        }
    }
}

/// An event delivered to a consumer but not yet acknowledged
///
/// A point-in-time snapshot of one row of the group's Pending Entries List.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    /// The pending event
    pub event_id: EventId,

    /// Consumer currently owning the entry
    pub consumer_name: String,

    /// Milliseconds since the entry was last delivered or claimed
    pub idle_ms: u64,

    /// How many times the entry has been delivered (first read counts as 1)
    pub delivery_count: u64,
}

/// A consumer registered in a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub name: String,

    /// Pending entries owned by this consumer
    pub pending: u64,

    /// Milliseconds since the consumer last interacted with the group
    pub idle_ms: u64,
}
