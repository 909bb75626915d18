//! Comparison of materialized state against state rebuilt from events.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value as JsonValue;

/// One path where materialized and rebuilt state disagree.
///
/// `None` means the path is absent on that side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Difference {
    pub path: String,
    pub current: Option<JsonValue>,
    pub rebuilt: Option<JsonValue>,
}

impl Difference {
    pub fn new(path: impl Into<String>, current: Option<JsonValue>, rebuilt: Option<JsonValue>) -> Self {
        Self {
            path: path.into(),
            current,
            rebuilt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub is_consistent: bool,
    pub differences: Vec<Difference>,
}

impl ConsistencyReport {
    pub fn from_differences(differences: Vec<Difference>) -> Self {
        Self {
            is_consistent: differences.is_empty(),
            differences,
        }
    }
}

/// Every leaf path at which `current` and `rebuilt` differ.
///
/// Paths use the same notation as the sensitive-field codec (`a.b`,
/// `items[2]`); the root itself is the empty path.
pub fn json_differences(current: &JsonValue, rebuilt: &JsonValue) -> Vec<Difference> {
    let mut out = Vec::new();
    diff_into(String::new(), Some(current), Some(rebuilt), &mut out);
    out
}

fn diff_into(path: String, current: Option<&JsonValue>, rebuilt: Option<&JsonValue>, out: &mut Vec<Difference>) {
    match (current, rebuilt) {
        (Some(JsonValue::Object(a)), Some(JsonValue::Object(b))) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                diff_into(child, a.get(key), b.get(key), out);
            }
        }
        (Some(JsonValue::Array(a)), Some(JsonValue::Array(b))) => {
            for i in 0..a.len().max(b.len()) {
                diff_into(format!("{path}[{i}]"), a.get(i), b.get(i), out);
            }
        }
        (a, b) if a == b => {}
        (a, b) => out.push(Difference::new(path, a.cloned(), b.cloned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_documents_have_no_differences() {
        let doc = json!({"name": "Ada", "tags": ["a", "b"], "address": {"city": "Oslo"}});
        assert!(json_differences(&doc, &doc.clone()).is_empty());
    }

    #[test]
    fn nested_and_missing_paths_are_reported() {
        let current = json!({"status": "discharged", "address": {"city": "Oslo"}, "tags": ["a"]});
        let rebuilt = json!({"status": "active", "address": {"city": "Oslo", "zip": "0150"}, "tags": ["a", "b"]});

        let paths: Vec<_> = json_differences(&current, &rebuilt)
            .into_iter()
            .map(|d| d.path)
            .collect();
        assert_eq!(paths, vec!["address.zip", "status", "tags[1]"]);
    }

    #[test]
    fn type_mismatch_at_root_uses_empty_path() {
        let diffs = json_differences(&json!(null), &json!({"a": 1}));
        assert_eq!(diffs, vec![Difference::new("", Some(json!(null)), Some(json!({"a": 1})))]);
    }

    #[test]
    fn report_is_consistent_only_without_differences() {
        assert!(ConsistencyReport::from_differences(vec![]).is_consistent);
        let report = ConsistencyReport::from_differences(vec![Difference::new("x", None, Some(json!(1)))]);
        assert!(!report.is_consistent);
    }
}
