//! Capability-checked secret reads.
//!
//! The `get` host function is installed only for catalysts. At
//! installation time the bridge receives the resolved `name -> value` map
//! of secrets currently granted to the component; a lookup is a map read,
//! never backend I/O. Names outside the snapshot always return
//! `access-denied`, which also closes the name-enumeration side channel -
//! a granted and an ungranted name are indistinguishable in timing.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use serde_json::{json, Value};

// Layer 3: Internal module imports
use crate::core::error::SandboxError;
use crate::core::reference::ComponentReference;

/// Snapshot-backed secret reads for one catalyst execution.
pub struct SecretsBridge {
    snapshot: Arc<HashMap<String, String>>,
    reference: String,
}

impl SecretsBridge {
    /// Create a bridge over the execution's secret snapshot.
    pub fn new(snapshot: Arc<HashMap<String, String>>, reference: &ComponentReference) -> Self {
        Self {
            snapshot,
            reference: reference.to_string(),
        }
    }

    /// `get` host function body.
    ///
    /// Accepts a bare secret name or a JSON string; returns
    /// `{"value": ...}` on success and an `access_denied` envelope
    /// otherwise. The raw value crosses into the guest here - masking on
    /// the egress paths is what keeps it from leaving the sandbox.
    pub fn get(&self, request: &str) -> String {
        let name = Self::parse_name(request);
        match self.snapshot.get(&name) {
            Some(value) => json!({"value": value}).to_string(),
            None => SandboxError::access_denied(name, &self.reference).to_envelope_string(),
        }
    }

    /// The values in the snapshot, for masker construction.
    pub fn values(&self) -> impl Iterator<Item = &String> {
        self.snapshot.values()
    }

    fn parse_name(request: &str) -> String {
        // Accept both `API_KEY` and `"API_KEY"` on the wire.
        if let Ok(Value::String(name)) = serde_json::from_str::<Value>(request) {
            return name;
        }
        request.trim().to_owned()
    }
}

impl std::fmt::Debug for SecretsBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the snapshot
        f.debug_struct("SecretsBridge")
            .field("reference", &self.reference)
            .field("granted", &self.snapshot.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    fn bridge() -> SecretsBridge {
        let mut snapshot = HashMap::new();
        snapshot.insert("API_KEY".to_owned(), "sk-verysecret123".to_owned());
        SecretsBridge::new(
            Arc::new(snapshot),
            &ComponentReference::parse("catalyst:weather.fetcher:1.0.0").unwrap(),
        )
    }

    #[test]
    fn test_granted_secret_is_returned() {
        let out = bridge().get("API_KEY");
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["value"], "sk-verysecret123");
    }

    #[test]
    fn test_json_string_name_is_accepted() {
        let out = bridge().get("\"API_KEY\"");
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["value"], "sk-verysecret123");
    }

    #[test]
    fn test_ungranted_secret_is_access_denied() {
        let out = bridge().get("OTHER_KEY");
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "access_denied");
        assert_eq!(
            value["error"]["message"],
            "access-denied: OTHER_KEY for catalyst:weather.fetcher:1.0.0"
        );
    }

    #[test]
    fn test_debug_never_prints_values() {
        let text = format!("{:?}", bridge());
        assert!(!text.contains("sk-verysecret123"));
    }
}
