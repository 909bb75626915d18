//! Aggregate type → topic mapping.

use std::collections::HashMap;

/// Domains with a fixed, well-known topic.
const KNOWN_TOPICS: &[(&str, &str)] = &[
    ("patient", "patient-events"),
    ("billing", "billing-events"),
    ("pharmacy", "pharmacy-events"),
    ("clinical", "clinical-events"),
    ("audit", "audit-events"),
    ("notification", "notification-events"),
    ("analytics", "analytics-events"),
    ("system", "system-events"),
];

/// Deterministic mapping from aggregate type to topic name.
///
/// Lookups are case-insensitive. Unknown aggregate types fall back to
/// `<aggregateType-lowercased>-events`.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    overrides: HashMap<String, String>,
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self {
            overrides: KNOWN_TOPICS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a static mapping.
    pub fn with_override(mut self, aggregate_type: &str, topic: impl Into<String>) -> Self {
        self.overrides
            .insert(aggregate_type.to_lowercase(), topic.into());
        self
    }

    pub fn with_overrides<I, K, V>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (k, v) in overrides {
            self.overrides.insert(k.as_ref().to_lowercase(), v.into());
        }
        self
    }

    pub fn topic_for(&self, aggregate_type: &str) -> String {
        let key = aggregate_type.to_lowercase();
        match self.overrides.get(&key) {
            Some(topic) => topic.clone(),
            None => format!("{key}-events"),
        }
    }

    /// Topic for a dotted event type, routed by its aggregate-type segment.
    pub fn topic_for_event_type(&self, event_type: &str) -> String {
        let aggregate_type = event_type.split('.').next().unwrap_or(event_type);
        self.topic_for(aggregate_type)
    }

    /// Distinct topics for a set of event types, in first-seen order.
    pub fn topics_for_event_types<S: AsRef<str>>(&self, event_types: &[S]) -> Vec<String> {
        let mut topics: Vec<String> = Vec::new();
        for t in event_types {
            let topic = self.topic_for_event_type(t.as_ref());
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        topics
    }
}
