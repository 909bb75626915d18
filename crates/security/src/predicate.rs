//! Sensitive-field predicates over `(path, value)`.
//!
//! Paths are dotted and relative to the event `data`; array elements are
//! written `items[0]`, so `patients[1].ssn` is the `ssn` of the second patient.

use std::sync::Arc;

use serde_json::Value as JsonValue;

type Matcher = dyn Fn(&str, &JsonValue) -> bool + Send + Sync;

/// Decides whether a payload field is sensitive.
#[derive(Clone)]
pub struct FieldPredicate {
    description: String,
    matcher: Arc<Matcher>,
}

impl core::fmt::Debug for FieldPredicate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("FieldPredicate").field(&self.description).finish()
    }
}

impl FieldPredicate {
    /// Matches when the last path segment equals `field` (case-insensitive).
    pub fn suffix(field: &str) -> Self {
        let field = field.to_string();
        Self {
            description: format!("*.{field}"),
            matcher: Arc::new(move |path, _| last_segment(path).eq_ignore_ascii_case(&field)),
        }
    }

    /// Matches every path under the top-level object `root` (case-insensitive).
    pub fn prefix(root: &str) -> Self {
        let prefix = format!("{}.", root.to_lowercase());
        Self {
            description: format!("{root}.*"),
            matcher: Arc::new(move |path, _| path.to_lowercase().starts_with(&prefix)),
        }
    }

    pub fn custom<F>(description: impl Into<String>, matcher: F) -> Self
    where
        F: Fn(&str, &JsonValue) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            matcher: Arc::new(matcher),
        }
    }

    pub fn matches(&self, path: &str, value: &JsonValue) -> bool {
        (self.matcher)(path, value)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Field name of the last segment, without array indices.
fn last_segment(path: &str) -> &str {
    let segment = path.rsplit('.').next().unwrap_or(path);
    segment.split('[').next().unwrap_or(segment)
}

/// Identity, payment, credential and health-record fields.
pub fn default_predicates() -> Vec<FieldPredicate> {
    vec![
        FieldPredicate::suffix("ssn"),
        FieldPredicate::suffix("socialSecurityNumber"),
        FieldPredicate::suffix("creditCard"),
        FieldPredicate::suffix("password"),
        FieldPredicate::suffix("secret"),
        FieldPredicate::suffix("medicalRecord"),
        FieldPredicate::prefix("phi"),
        FieldPredicate::prefix("pii"),
    ]
}
