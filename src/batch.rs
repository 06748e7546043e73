//! Event batches
//!
//! A group read (or a claim) returns entries in the store's raw shape: stream
//! key, entry id, and a flat `[field, value, field, value, ...]` list. This
//! module turns that shape into an ordered [`EventBatch`] of [`Event`]s.

use std::slice;

use tracing::warn;

use crate::types::{Event, EventId};

/// One raw stream entry as returned by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub id: String,

    /// Flat field list: names at even indexes, values at odd ones
    pub fields: Vec<String>,
}

impl RawEntry {
    pub fn new(id: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Build a raw entry from field pairs
    pub fn from_pairs(id: impl Into<String>, pairs: &[(String, String)]) -> Self {
        let fields = pairs
            .iter()
            .flat_map(|(key, value)| [key.clone(), value.clone()])
            .collect();
        Self::new(id, fields)
    }
}

/// Entries for one stream key in a read reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReply {
    pub stream: String,
    pub entries: Vec<RawEntry>,
}

/// Raw reply of a group read: entries grouped per stream key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadReply {
    pub streams: Vec<StreamReply>,
}

impl ReadReply {
    /// Reply carrying entries for a single stream
    ///
    /// Claimed entries are reshaped this way so replays go through the same
    /// parsing as fresh reads.
    pub fn single(stream: impl Into<String>, entries: Vec<RawEntry>) -> Self {
        Self {
            streams: vec![StreamReply {
                stream: stream.into(),
                entries,
            }],
        }
    }

    /// Total number of entries across all stream keys
    pub fn entry_count(&self) -> usize {
        self.streams.iter().map(|s| s.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }
}

/// Ordered events materialized from one read or one reclaim
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBatch {
    stream: String,
    events: Vec<Event>,
    skipped: Vec<String>,
}

impl EventBatch {
    /// Parse the entries of `stream` out of a read reply
    ///
    /// Entries keep their delivered order. Entries of other stream keys are
    /// ignored. Malformed entries (empty id, odd field list) are skipped and
    /// logged; they stay pending in the store and follow the replay path.
    ///
    /// # Example
    ///
    /// ```
    /// use redstream::batch::{EventBatch, RawEntry, ReadReply};
    ///
    /// let reply = ReadReply::single(
    ///     "orders",
    ///     vec![RawEntry::new("1-0", vec!["type".into(), "Placed".into()])],
    /// );
    /// let batch = EventBatch::from_reply(reply, "orders");
    /// assert_eq!(batch.len(), 1);
    /// assert_eq!(batch.events()[0].field("type"), Some("Placed"));
    /// ```
    pub fn from_reply(reply: ReadReply, stream: &str) -> Self {
        let mut events = Vec::new();
        let mut skipped = Vec::new();

        for stream_reply in reply.streams {
            if stream_reply.stream != stream {
                warn!(
                    expected = %stream,
                    received = %stream_reply.stream,
                    "Ignoring entries for unexpected stream key"
                );
                continue;
            }

            for entry in stream_reply.entries {
                match parse_entry(entry) {
                    Ok(event) => events.push(event),
                    Err(id) => skipped.push(id),
                }
            }
        }

        Self {
            stream: stream.to_string(),
            events,
            skipped,
        }
    }

    /// The stream the batch was read from
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Events in delivered order
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Ids of entries that could not be parsed
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Ids of the parsed events, in order
    pub fn ids(&self) -> Vec<EventId> {
        self.events.iter().map(|e| e.id().clone()).collect()
    }

    pub fn iter(&self) -> slice::Iter<'_, Event> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl<'a> IntoIterator for &'a EventBatch {
    type Item = &'a Event;
    type IntoIter = slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

impl IntoIterator for EventBatch {
    type Item = Event;
    type IntoIter = std::vec::IntoIter<Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

/// Parse one raw entry, returning the entry id on failure
fn parse_entry(entry: RawEntry) -> std::result::Result<Event, String> {
    if entry.id.trim().is_empty() {
        warn!(fields = entry.fields.len(), "Skipping stream entry without an id");
        return Err(entry.id);
    }

    if entry.fields.len() % 2 != 0 {
        warn!(
            event_id = %entry.id,
            fields = entry.fields.len(),
            "Skipping stream entry with an odd field list"
        );
        return Err(entry.id);
    }

    let mut fields = Vec::with_capacity(entry.fields.len() / 2);
    let mut iter = entry.fields.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        fields.push((key, value));
    }

    Ok(Event::new(entry.id, fields))
}
