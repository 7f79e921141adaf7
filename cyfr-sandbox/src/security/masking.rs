//! Secret redaction on every egress path.
//!
//! A [`SecretMasker`] is built once per execution from the values of all
//! secrets granted to the component, and applied to: the component's
//! returned output, the journal's `output` and `logs` fields, every error
//! message, and HTTP response bodies (an attacker-controlled server could
//! otherwise echo a secret back to the guest).
//!
//! For each secret value of at least four bytes, the masker also matches
//! its base64, base64-url, and hex encodings (both cases), so a component
//! cannot smuggle a secret out by re-encoding it. Shorter secrets are
//! ignored to avoid false positives.

// Layer 1: Standard library imports
use std::collections::BTreeSet;

// Layer 2: Third-party crate imports
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::Value;

// Layer 3: Internal module imports
// (none - leaf module)

/// Replacement literal for every masked occurrence.
pub const REDACTED: &str = "[REDACTED]";

/// Minimum secret length considered for masking.
pub const MIN_SECRET_LEN: usize = 4;

/// Replaces granted-secret substrings with [`REDACTED`].
///
/// # Examples
///
/// ```
/// use cyfr_sandbox::security::masking::SecretMasker;
///
/// let masker = SecretMasker::new(["sk-verysecret123"]);
/// assert_eq!(
///     masker.mask_str("token is sk-verysecret123, keep safe"),
///     "token is [REDACTED], keep safe"
/// );
/// // Encoded forms are masked too
/// assert!(!masker.mask_str("c2stdmVyeXNlY3JldDEyMw==").contains("c2st"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    /// All needles, longest first so overlapping variants mask cleanly.
    needles: Vec<String>,
}

impl SecretMasker {
    /// Build a masker from the granted secret values.
    ///
    /// Values shorter than [`MIN_SECRET_LEN`] are skipped.
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        // BTreeSet dedups variants that collide across secrets.
        let mut needles = BTreeSet::new();
        for value in values {
            let value = value.as_ref();
            if value.len() < MIN_SECRET_LEN {
                continue;
            }
            let bytes = value.as_bytes();
            needles.insert(value.to_owned());
            needles.insert(STANDARD.encode(bytes));
            needles.insert(STANDARD_NO_PAD.encode(bytes));
            needles.insert(URL_SAFE.encode(bytes));
            needles.insert(URL_SAFE_NO_PAD.encode(bytes));
            needles.insert(hex::encode(bytes));
            needles.insert(hex::encode_upper(bytes));
        }

        let mut needles: Vec<String> = needles.into_iter().collect();
        needles.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Self { needles }
    }

    /// Whether this masker has anything to redact.
    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }

    /// Mask every needle occurrence in one string.
    pub fn mask_str(&self, input: &str) -> String {
        let mut output = input.to_owned();
        for needle in &self.needles {
            if output.contains(needle.as_str()) {
                output = output.replace(needle.as_str(), REDACTED);
            }
        }
        output
    }

    /// Recursively mask a JSON tree: map keys, map values, list elements,
    /// and bare strings. Numbers, booleans, and nulls pass through.
    pub fn mask_value(&self, value: &Value) -> Value {
        if self.is_empty() {
            return value.clone();
        }
        match value {
            Value::String(s) => Value::String(self.mask_str(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.mask_value(item)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| (self.mask_str(key), self.mask_value(item)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Mask an error message before it reaches a journal row or log line.
    pub fn mask_error(&self, message: &str) -> String {
        self.mask_str(message)
    }
}
