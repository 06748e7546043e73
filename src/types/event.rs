use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{Error, Result};

/// Store-assigned event identifier
///
/// Opaque to the consumer: uniqueness and ordering are the store's business.
/// Redis ids look like `1700000000000-0`, the Postgres store uses the global
/// position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Create an id from its string form
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the id and return the owned string
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for EventId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An event read from the stream
///
/// Immutable once read. Fields keep the order in which the producer wrote
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    fields: Vec<(String, String)>,
}

impl Event {
    /// Create an event
    ///
    /// # Example
    ///
    /// ```
    /// use redstream::types::Event;
    ///
    /// let event = Event::new(
    ///     "1700000000000-0",
    ///     vec![("type".to_string(), "Withdrawn".to_string())],
    /// );
    /// assert_eq!(event.field("type"), Some("Withdrawn"));
    /// ```
    pub fn new(id: impl Into<EventId>, fields: Vec<(String, String)>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// The store-assigned id
    pub fn id(&self) -> &EventId {
        &self.id
    }

    /// All fields, in write order
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Get the value of a field
    ///
    /// If the producer wrote the same field name twice the first one wins.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Parse a field holding a JSON document
    ///
    /// # Example
    ///
    /// ```
    /// use redstream::types::Event;
    ///
    /// let event = Event::new(
    ///     "1-0",
    ///     vec![("data".to_string(), r#"{"amount": 50}"#.to_string())],
    /// );
    /// assert_eq!(event.json_field("data").unwrap()["amount"], 50);
    /// ```
    pub fn json_field(&self, name: &str) -> Result<Value> {
        let raw = self
            .field(name)
            .ok_or_else(|| Error::Validation(format!("event {} has no field '{}'", self.id, name)))?;
        Ok(serde_json::from_str(raw)?)
    }

    /// Render the fields as a JSON object of strings
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.fields {
            map.entry(key.clone())
                .or_insert_with(|| Value::String(value.clone()));
        }
        Value::Object(map)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the event carries no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_field_lookup_keeps_first_duplicate() {
        let event = Event::new("5-0", pairs(&[("a", "1"), ("b", "2"), ("a", "3")]));

        assert_eq!(event.field("a"), Some("1"));
        assert_eq!(event.field("b"), Some("2"));
        assert_eq!(event.field("missing"), None);
        assert_eq!(event.len(), 3);
    }

    #[test]
    fn test_fields_keep_write_order() {
        let event = Event::new("5-0", pairs(&[("z", "1"), ("a", "2"), ("m", "3")]));
        let names: Vec<&str> = event.fields().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_json_field() {
        let event = Event::new("7-1", pairs(&[("payload", r#"{"user": "ada", "n": 2}"#)]));
        let payload = event.json_field("payload").unwrap();
        assert_eq!(payload, json!({ "user": "ada", "n": 2 }));
    }

    #[test]
    fn test_json_field_errors() {
        let event = Event::new("7-1", pairs(&[("payload", "not json")]));
        assert!(matches!(event.json_field("payload"), Err(Error::Validation(_))));
        assert!(matches!(event.json_field("other"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_to_json() {
        let event = Event::new("9-0", pairs(&[("type", "Deposited"), ("amount", "50")]));
        assert_eq!(event.to_json(), json!({ "type": "Deposited", "amount": "50" }));
    }

    #[test]
    fn test_event_id_conversions() {
        let id = EventId::from("1700000000000-3");
        assert_eq!(id.as_str(), "1700000000000-3");
        assert_eq!(id.to_string(), "1700000000000-3");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"1700000000000-3\"");
        assert_eq!(id.into_string(), "1700000000000-3".to_string());
    }
}
