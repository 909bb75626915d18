use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use chronicle_core::{CorrelationId, DomainError, DomainResult, EventId, StreamKey};

/// Metadata carried by every event.
///
/// `correlation_id` is always present once an event is persisted; the other
/// well-known keys are optional, and anything else lands in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub correlation_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(flatten, default)]
    pub extra: Map<String, JsonValue>,
}

/// Keys of the typed metadata fields; they may not appear in `extra`.
pub const RESERVED_METADATA_KEYS: [&str; 4] = ["correlationId", "causationId", "userId", "timestamp"];

impl EventMetadata {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            causation_id: None,
            user_id: None,
            timestamp: None,
            extra: Map::new(),
        }
    }
}

/// A persisted domain event: the immutable unit of record.
///
/// Events are:
/// - **immutable** (facts; never updated, only appended)
/// - **stream-ordered** by `version` within `(aggregate_id, aggregate_type)`
/// - **self-describing** via the dotted `type` (`<aggregateType>.<verb>`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub id: EventId,

    #[serde(rename = "type")]
    pub event_type: String,

    pub aggregate_id: String,
    pub aggregate_type: String,

    /// Gap-free position in the aggregate stream, starting at 1.
    pub version: u64,

    pub data: JsonValue,
    pub metadata: EventMetadata,

    /// Server-assigned creation instant.
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.aggregate_id.clone(), self.aggregate_type.clone())
    }

    pub fn correlation_id(&self) -> &str {
        &self.metadata.correlation_id
    }
}

/// Producer-side input to `append`: everything except the server-assigned
/// `id` and `timestamp`.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub event_type: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: u64,
    pub data: JsonValue,

    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub user_id: Option<String>,
    pub extra_metadata: Map<String, JsonValue>,
}

impl EventDraft {
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        version: u64,
        data: JsonValue,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            version,
            data,
            correlation_id: None,
            causation_id: None,
            user_id: None,
            extra_metadata: Map::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.extra_metadata.insert(key.into(), value);
        self
    }

    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.aggregate_id.clone(), self.aggregate_type.clone())
    }

    /// Structural validation done before any IO.
    ///
    /// The type must be `<aggregateType>.<verb>`; subscriptions route by the
    /// type's first segment, so it has to name the owning aggregate type.
    pub fn validate(&self) -> DomainResult<()> {
        self.stream_key().validate()?;

        let (prefix, verb) = self.event_type.split_once('.').ok_or_else(|| {
            DomainError::validation(format!(
                "event type '{}' must be '<aggregateType>.<verb>'",
                self.event_type
            ))
        })?;
        if verb.is_empty() {
            return Err(DomainError::validation(format!(
                "event type '{}' has an empty verb",
                self.event_type
            )));
        }
        if !prefix.eq_ignore_ascii_case(&self.aggregate_type) {
            return Err(DomainError::validation(format!(
                "event type '{}' does not belong to aggregate type '{}'",
                self.event_type, self.aggregate_type
            )));
        }
        if let Some(key) = self
            .extra_metadata
            .keys()
            .find(|k| RESERVED_METADATA_KEYS.contains(&k.as_str()))
        {
            return Err(DomainError::validation(format!(
                "metadata key '{key}' is reserved; use the typed builder instead"
            )));
        }
        Ok(())
    }

    /// Finalize the draft with server-assigned identity and time.
    pub fn into_event(self, id: EventId, timestamp: DateTime<Utc>) -> DomainEvent {
        let metadata = EventMetadata {
            correlation_id: self
                .correlation_id
                .unwrap_or_else(|| CorrelationId::new().to_string()),
            causation_id: self.causation_id,
            user_id: self.user_id,
            timestamp: Some(timestamp),
            extra: self.extra_metadata,
        };

        DomainEvent {
            id,
            event_type: self.event_type,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            version: self.version,
            data: self.data,
            metadata,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn into_event_assigns_correlation_when_missing() {
        let now = Utc::now();
        let event = EventDraft::new("patient.created", "P1", "patient", 1, json!({}))
            .into_event(EventId::new(), now);

        assert!(!event.metadata.correlation_id.is_empty());
        assert_eq!(event.metadata.timestamp, Some(now));
        assert_eq!(event.timestamp, now);
    }

    #[test]
    fn into_event_keeps_caller_metadata() {
        let event = EventDraft::new("patient.updated", "P1", "patient", 2, json!({}))
            .with_correlation_id("corr-1")
            .with_causation_id("cmd-9")
            .with_user_id("u-7")
            .with_metadata("source", json!("admissions"))
            .into_event(EventId::new(), Utc::now());

        assert_eq!(event.correlation_id(), "corr-1");
        assert_eq!(event.metadata.causation_id.as_deref(), Some("cmd-9"));
        assert_eq!(event.metadata.user_id.as_deref(), Some("u-7"));
        assert_eq!(event.metadata.extra["source"], json!("admissions"));
    }

    #[test]
    fn validate_requires_type_owned_by_aggregate() {
        let ok = EventDraft::new("patient.created", "P1", "patient", 1, json!({}));
        assert!(ok.validate().is_ok());

        let no_verb = EventDraft::new("patient", "P1", "patient", 1, json!({}));
        assert!(no_verb.validate().is_err());

        let foreign = EventDraft::new("billing.created", "P1", "patient", 1, json!({}));
        assert!(foreign.validate().is_err());
    }

    #[test]
    fn validate_rejects_reserved_metadata_keys() {
        for key in RESERVED_METADATA_KEYS {
            let draft = EventDraft::new("patient.created", "P1", "patient", 1, json!({}))
                .with_user_id("u-1")
                .with_metadata(key, json!("u-2"));
            let err = draft.validate().unwrap_err();
            assert!(err.to_string().contains(key), "{err}");
        }

        let custom = EventDraft::new("patient.created", "P1", "patient", 1, json!({}))
            .with_metadata("tenant", json!("north"));
        assert!(custom.validate().is_ok());
    }

    #[test]
    fn json_shape_uses_camel_case_and_type_key() {
        let event = EventDraft::new("patient.created", "P1", "patient", 1, json!({"name": "Ada"}))
            .with_correlation_id("c-1")
            .into_event(EventId::new(), Utc::now());

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("patient.created"));
        assert_eq!(value["aggregateId"], json!("P1"));
        assert_eq!(value["aggregateType"], json!("patient"));
        assert_eq!(value["metadata"]["correlationId"], json!("c-1"));

        let back: DomainEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
