//! Field-level protection of event payloads.
//!
//! The codec walks a JSON payload and applies the `EncryptionService` to
//! every string leaf whose path matches one of its predicates. Structure is
//! never changed: object keys, array lengths and non-string leaves stay put.

use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::encryption::{CryptoError, EncryptionService};
use crate::predicate::{FieldPredicate, default_predicates};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encrypt field '{path}': {source}")]
    Encryption {
        path: String,
        #[source]
        source: CryptoError,
    },
}

/// A leaf that could not be decrypted and was left as ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptFailure {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecryptOutcome {
    pub data: JsonValue,
    pub failures: Vec<DecryptFailure>,
    /// Paths of sensitive leaves that were stored in plaintext.
    pub unencrypted: Vec<String>,
}

impl DecryptOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone)]
pub struct SensitiveFieldCodec {
    predicates: Vec<FieldPredicate>,
    encryption: Arc<dyn EncryptionService>,
}

impl core::fmt::Debug for SensitiveFieldCodec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SensitiveFieldCodec")
            .field("predicates", &self.predicates)
            .finish_non_exhaustive()
    }
}

impl SensitiveFieldCodec {
    /// Codec with the default predicate set.
    pub fn new(encryption: Arc<dyn EncryptionService>) -> Self {
        Self::with_predicates(encryption, default_predicates())
    }

    pub fn with_predicates(
        encryption: Arc<dyn EncryptionService>,
        predicates: Vec<FieldPredicate>,
    ) -> Self {
        Self {
            predicates,
            encryption,
        }
    }

    pub fn add_predicate(mut self, predicate: FieldPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn is_sensitive(&self, path: &str, value: &JsonValue) -> bool {
        self.predicates.iter().any(|p| p.matches(path, value))
    }

    /// Replace every sensitive string leaf with ciphertext.
    ///
    /// Leaves that are already ciphertext are kept, so encrypting twice is
    /// the same as encrypting once.
    pub fn encrypt(&self, data: &JsonValue) -> Result<JsonValue, CodecError> {
        let mut out = data.clone();
        let mut error = None;
        visit_strings(&mut out, &mut String::new(), &mut |path: &str, leaf: &mut JsonValue| {
            if error.is_some() || !self.is_sensitive(path, leaf) {
                return;
            }
            let JsonValue::String(text) = leaf else {
                return;
            };
            if self.encryption.is_ciphertext(text) {
                return;
            }
            match self.encryption.encrypt_text(text) {
                Ok(token) => *text = token,
                Err(source) => {
                    error = Some(CodecError::Encryption {
                        path: path.to_string(),
                        source,
                    })
                }
            }
        });

        match error {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// Restore encrypted leaves in place.
    ///
    /// Every ciphertext leaf is decrypted, whether or not a predicate still
    /// matches it. Never fails as a whole: a leaf that cannot be decrypted
    /// keeps its ciphertext and is reported in `failures`, and a sensitive
    /// leaf found in plaintext is kept as is and reported in `unencrypted`.
    pub fn decrypt(&self, data: &JsonValue) -> DecryptOutcome {
        let mut out = data.clone();
        let mut failures = Vec::new();
        let mut unencrypted = Vec::new();
        visit_strings(&mut out, &mut String::new(), &mut |path: &str, leaf: &mut JsonValue| {
            let sealed = leaf.as_str().is_some_and(|t| self.encryption.is_ciphertext(t));
            if !sealed {
                if self.is_sensitive(path, leaf) {
                    tracing::warn!(path = %path, "sensitive field stored unencrypted");
                    unencrypted.push(path.to_string());
                }
                return;
            }
            let JsonValue::String(text) = leaf else {
                return;
            };
            match self.encryption.decrypt_text(text) {
                Ok(plain) => *text = plain,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to decrypt sensitive field");
                    failures.push(DecryptFailure {
                        path: path.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        });

        DecryptOutcome {
            data: out,
            failures,
            unencrypted,
        }
    }
}

/// Depth-first walk calling `f` on every string leaf with its path.
fn visit_strings<F>(value: &mut JsonValue, path: &mut String, f: &mut F)
where
    F: FnMut(&str, &mut JsonValue),
{
    if value.is_string() {
        f(path.as_str(), value);
        return;
    }
    match value {
        JsonValue::Object(map) => visit_object(map, path, f),
        JsonValue::Array(items) => {
            for (index, item) in items.iter_mut().enumerate() {
                let restore = path.len();
                path.push_str(&format!("[{index}]"));
                visit_strings(item, path, f);
                path.truncate(restore);
            }
        }
        _ => {}
    }
}

fn visit_object<F>(map: &mut Map<String, JsonValue>, path: &mut String, f: &mut F)
where
    F: FnMut(&str, &mut JsonValue),
{
    for (key, child) in map.iter_mut() {
        let restore = path.len();
        if !path.is_empty() {
            path.push('.');
        }
        path.push_str(key);
        visit_strings(child, path, f);
        path.truncate(restore);
    }
}
