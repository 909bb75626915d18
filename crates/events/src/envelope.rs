use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::DomainEvent;

/// Header names attached to every published event.
pub mod headers {
    pub const EVENT_TYPE: &str = "eventType";
    pub const AGGREGATE_TYPE: &str = "aggregateType";
    pub const VERSION: &str = "version";
    pub const TIMESTAMP: &str = "timestamp";
    pub const CORRELATION_ID: &str = "correlationId";
}

/// One message on the bus.
///
/// - `key` is the aggregate id, so one stream always lands in one partition.
/// - `value` is the JSON-serialized event exactly as persisted (sensitive
///   leaves already encrypted).
/// - `headers` let consumers filter without decoding the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub key: String,
    pub value: String,
    pub headers: BTreeMap<String, String>,
}

impl BusMessage {
    /// Build the wire message for an (already encrypted) event.
    pub fn from_event(event: &DomainEvent) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_string(event)?;

        let mut h = BTreeMap::new();
        h.insert(headers::EVENT_TYPE.to_string(), event.event_type.clone());
        h.insert(headers::AGGREGATE_TYPE.to_string(), event.aggregate_type.clone());
        h.insert(headers::VERSION.to_string(), event.version.to_string());
        h.insert(headers::TIMESTAMP.to_string(), event.timestamp.to_rfc3339());
        h.insert(
            headers::CORRELATION_ID.to_string(),
            event.metadata.correlation_id.clone(),
        );

        Ok(Self {
            key: event.aggregate_id.clone(),
            value,
            headers: h,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header(headers::EVENT_TYPE)
    }

    /// Decode the event carried in `value`.
    pub fn decode(&self) -> Result<DomainEvent, serde_json::Error> {
        serde_json::from_str(&self.value)
    }
}
