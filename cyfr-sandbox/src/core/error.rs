//! Error taxonomy for the execution sandbox.
//!
//! Every failure mode is a variant of [`SandboxError`]. Each variant maps to
//! exactly one stable kind string (see [`SandboxError::kind`]) which appears
//! in guest-visible JSON envelopes, journal rows, and log lines.
//!
//! # Error Philosophy
//!
//! - **Structured variants**: every error carries the values that caused it
//! - **Diagnosable denials**: policy denials name both the rejected value
//!   and the allowed set
//! - **Envelopes, not panics**: host functions never panic the executor;
//!   failures become `{"error": {"type", "message"}}` envelopes returned to
//!   the component
//!
//! # Examples
//!
//! ```
//! use cyfr_sandbox::core::error::SandboxError;
//!
//! let err = SandboxError::domain_blocked("evil.com", &["api.good.com".to_string()]);
//! assert_eq!(err.kind(), "domain_blocked");
//! assert!(err.to_string().contains("evil.com"));
//! assert!(err.to_string().contains("api.good.com"));
//! ```

// Layer 1: Standard library imports
use std::net::IpAddr;

// Layer 2: Third-party crate imports
use serde_json::{json, Value};
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Comprehensive error type for sandbox operations.
///
/// Variants are grouped by where they surface:
///
/// - **Pre-flight** (no execution record written): `InvalidRef`,
///   `UnknownRole`, `PolicyNotConfigured`, `RateLimited`, `RequestTooLarge`
/// - **Returned to the component** as envelopes: the HTTP / MCP / secrets
///   denials and size violations
/// - **Terminal record statuses**: `ExecutionFailed`, `Cancelled`
/// - **Journal and infrastructure**: `InvalidTransition`, `NotCancellable`,
///   `NotFound`, `Store`, `Registry`, `Engine`
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Reference string or path did not parse into a component reference.
    #[error("Invalid component reference '{value}': {reason}")]
    InvalidRef {
        /// The rejected input.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Role hint was not one of `catalyst`, `reagent`, `formula`.
    #[error("Unknown component role '{value}' (expected catalyst, reagent, or formula)")]
    UnknownRole {
        /// The rejected role tag.
        value: String,
    },

    /// Host function input could not be parsed as JSON.
    #[error("Invalid JSON in host function request: {reason}")]
    InvalidJson {
        /// Parser diagnostic.
        reason: String,
    },

    /// Well-formed JSON missing required fields.
    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// What was missing or contradictory.
        reason: String,
    },

    /// HTTP host not in the policy's `allowed_domains`.
    #[error("Domain '{host}' is not allowed (allowed domains: [{}])", allowed.join(", "))]
    DomainBlocked {
        /// The rejected host.
        host: String,
        /// The policy's allowed set at the time of the check.
        allowed: Vec<String>,
    },

    /// HTTP method not in the policy's `allowed_methods`.
    #[error("Method '{method}' is not allowed (allowed methods: [{}])", allowed.join(", "))]
    MethodBlocked {
        /// The rejected method.
        method: String,
        /// The policy's allowed set at the time of the check.
        allowed: Vec<String>,
    },

    /// Resolved IP address falls in the private/reserved set.
    #[error("Host '{host}' resolves to reserved address {addr}")]
    PrivateIpBlocked {
        /// Hostname from the request URL.
        host: String,
        /// The offending resolved address.
        addr: IpAddr,
    },

    /// Name resolution failed.
    #[error("DNS resolution failed for '{host}': {reason}")]
    DnsError {
        /// Hostname that failed to resolve.
        host: String,
        /// Resolver diagnostic.
        reason: String,
    },

    /// A request-side size cap was exceeded.
    #[error("{what} size {size} bytes exceeds limit of {limit} bytes")]
    RequestTooLarge {
        /// Which payload violated the cap ("Input", "Request body", "Multipart body").
        what: String,
        /// Observed size.
        size: usize,
        /// Policy limit.
        limit: usize,
    },

    /// Response body exceeded `max_response_size`.
    #[error("Response exceeds limit of {limit} bytes")]
    ResponseTooLarge {
        /// Policy limit.
        limit: usize,
    },

    /// Too many live streams for this execution.
    #[error("Stream limit reached ({limit} concurrent streams per execution)")]
    StreamLimit {
        /// Per-execution cap.
        limit: usize,
    },

    /// Stream handle unknown to this execution's registry.
    #[error("Unknown stream handle {handle}")]
    InvalidHandle {
        /// The rejected handle.
        handle: u64,
    },

    /// Rate quota exceeded for `(user, component)`.
    #[error("Rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited {
        /// Milliseconds until the current window ends.
        retry_after_ms: u64,
    },

    /// MCP tool not in the policy's `allowed_tools`.
    #[error("Tool '{tool}' is not allowed (allowed tools: [{}])", allowed.join(", "))]
    ToolDenied {
        /// The rejected `service.action` name.
        tool: String,
        /// The policy's allowed set at the time of the check.
        allowed: Vec<String>,
    },

    /// Storage path outside the policy's `allowed_storage_paths`.
    #[error("Storage path '{path}' is not allowed (allowed prefixes: [{}])", allowed.join(", "))]
    StoragePathDenied {
        /// The rejected path.
        path: String,
        /// The policy's allowed prefixes at the time of the check.
        allowed: Vec<String>,
    },

    /// Unknown tool or downstream service failure.
    #[error("Dispatch failed for tool '{tool}': {reason}")]
    DispatchError {
        /// The `service.action` name that failed to dispatch.
        tool: String,
        /// Downstream diagnostic.
        reason: String,
    },

    /// Secret not granted to this component.
    #[error("access-denied: {name} for {reference}")]
    AccessDenied {
        /// Requested secret name.
        name: String,
        /// Canonical reference of the requesting component.
        reference: String,
    },

    /// Catalyst has no usable policy; surfaced to the caller pre-flight.
    #[error("Policy not configured for '{reference}': {reason}")]
    PolicyNotConfigured {
        /// Canonical reference of the component.
        reference: String,
        /// What is missing (always names `allowed_domains` for catalysts).
        reason: String,
    },

    /// Guest trap, fuel/memory exhaustion, or timeout.
    #[error("Execution failed: {reason}")]
    ExecutionFailed {
        /// Classified failure message.
        reason: String,
    },

    /// Execution was cancelled (explicit cancel or teardown).
    #[error("Execution cancelled")]
    Cancelled,

    /// Cancel was requested for a record that is not `Running`.
    #[error("Execution '{id}' is not cancellable (status: {status})")]
    NotCancellable {
        /// Execution id.
        id: String,
        /// Current terminal status.
        status: String,
    },

    /// Terminal journal write against a record that is not `Running`.
    #[error("Invalid status transition for '{id}': record is {from}, not Running")]
    InvalidTransition {
        /// Execution id.
        id: String,
        /// Status found in the store.
        from: String,
    },

    /// Record (or component) does not exist for this user.
    #[error("Not found: {id}")]
    NotFound {
        /// The missing id.
        id: String,
    },

    /// Execution store I/O failure.
    #[error("Execution store error: {reason}")]
    Store {
        /// Backend diagnostic.
        reason: String,
    },

    /// Component registry failure while fetching bytes.
    #[error("Registry error for '{reference}': {reason}")]
    Registry {
        /// Canonical reference of the component.
        reference: String,
        /// Backend diagnostic.
        reason: String,
    },

    /// Wasmtime engine initialization or linking failure (host-side bug or
    /// misconfiguration, not a guest fault).
    #[error("Engine error: {reason}")]
    Engine {
        /// Engine diagnostic.
        reason: String,
    },
}

impl SandboxError {
    /// Stable kind string as it appears in JSON envelopes and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRef { .. } => "invalid_ref",
            Self::UnknownRole { .. } => "unknown_role",
            Self::InvalidJson { .. } => "invalid_json",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::DomainBlocked { .. } => "domain_blocked",
            Self::MethodBlocked { .. } => "method_blocked",
            Self::PrivateIpBlocked { .. } => "private_ip_blocked",
            Self::DnsError { .. } => "dns_error",
            Self::RequestTooLarge { .. } => "request_too_large",
            Self::ResponseTooLarge { .. } => "response_too_large",
            Self::StreamLimit { .. } => "stream_limit",
            Self::InvalidHandle { .. } => "invalid_handle",
            Self::RateLimited { .. } => "rate_limited",
            Self::ToolDenied { .. } => "tool_denied",
            Self::StoragePathDenied { .. } => "storage_path_denied",
            Self::DispatchError { .. } => "dispatch_error",
            Self::AccessDenied { .. } => "access_denied",
            Self::PolicyNotConfigured { .. } => "policy_not_configured",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::Cancelled => "cancelled",
            Self::NotCancellable { .. } => "not_cancellable",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotFound { .. } => "not_found",
            Self::Store { .. } => "store_error",
            Self::Registry { .. } => "registry_error",
            Self::Engine { .. } => "engine_error",
        }
    }

    /// Guest-visible error envelope: `{"error": {"type", "message"}}`.
    pub fn to_envelope(&self) -> Value {
        json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        })
    }

    /// Envelope serialized to a JSON string, for host function returns.
    pub fn to_envelope_string(&self) -> String {
        self.to_envelope().to_string()
    }

    // --- helper constructors ---------------------------------------------

    /// Invalid reference input.
    pub fn invalid_ref(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRef {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Unknown role tag.
    pub fn unknown_role(value: impl Into<String>) -> Self {
        Self::UnknownRole {
            value: value.into(),
        }
    }

    /// Unparseable host function input.
    pub fn invalid_json(reason: impl Into<String>) -> Self {
        Self::InvalidJson {
            reason: reason.into(),
        }
    }

    /// Well-formed JSON with missing or contradictory fields.
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Host rejected by `allowed_domains`.
    pub fn domain_blocked(host: impl Into<String>, allowed: &[String]) -> Self {
        Self::DomainBlocked {
            host: host.into(),
            allowed: allowed.to_vec(),
        }
    }

    /// Method rejected by `allowed_methods`.
    pub fn method_blocked(method: impl Into<String>, allowed: &[String]) -> Self {
        Self::MethodBlocked {
            method: method.into(),
            allowed: allowed.to_vec(),
        }
    }

    /// Resolved address is in the reserved set.
    pub fn private_ip_blocked(host: impl Into<String>, addr: IpAddr) -> Self {
        Self::PrivateIpBlocked {
            host: host.into(),
            addr,
        }
    }

    /// Name resolution failure.
    pub fn dns_error(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DnsError {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Request-side size cap exceeded.
    pub fn request_too_large(what: impl Into<String>, size: usize, limit: usize) -> Self {
        Self::RequestTooLarge {
            what: what.into(),
            size,
            limit,
        }
    }

    /// Tool rejected by `allowed_tools`.
    pub fn tool_denied(tool: impl Into<String>, allowed: &[String]) -> Self {
        Self::ToolDenied {
            tool: tool.into(),
            allowed: allowed.to_vec(),
        }
    }

    /// Storage path rejected by `allowed_storage_paths` or the write namespace.
    pub fn storage_path_denied(path: impl Into<String>, allowed: &[String]) -> Self {
        Self::StoragePathDenied {
            path: path.into(),
            allowed: allowed.to_vec(),
        }
    }

    /// Unknown tool or downstream failure.
    pub fn dispatch_error(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DispatchError {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Secret not granted to the requesting component.
    pub fn access_denied(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self::AccessDenied {
            name: name.into(),
            reference: reference.into(),
        }
    }

    /// Catalyst pre-flight gate failure.
    pub fn policy_not_configured(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PolicyNotConfigured {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    /// Classified guest failure.
    pub fn execution_failed(reason: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            reason: reason.into(),
        }
    }

    /// Store backend failure.
    pub fn store(reason: impl Into<String>) -> Self {
        Self::Store {
            reason: reason.into(),
        }
    }

    /// Registry backend failure.
    pub fn registry(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Registry {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    /// Engine-side failure.
    pub fn engine(reason: impl Into<String>) -> Self {
        Self::Engine {
            reason: reason.into(),
        }
    }

    /// Missing record or component.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    #[test]
    fn test_denial_messages_name_value_and_allowed_set() {
        let err = SandboxError::domain_blocked(
            "evil.com",
            &["api.good.com".to_string(), "*.partner.io".to_string()],
        );
        let msg = err.to_string();
        assert!(msg.contains("evil.com"));
        assert!(msg.contains("api.good.com"));
        assert!(msg.contains("*.partner.io"));
    }

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(SandboxError::invalid_json("x").kind(), "invalid_json");
        assert_eq!(
            SandboxError::domain_blocked("h", &[]).kind(),
            "domain_blocked"
        );
        assert_eq!(
            SandboxError::RateLimited {
                retry_after_ms: 100
            }
            .kind(),
            "rate_limited"
        );
        assert_eq!(SandboxError::Cancelled.kind(), "cancelled");
        assert_eq!(
            SandboxError::execution_failed("trap").kind(),
            "execution_failed"
        );
    }

    #[test]
    fn test_envelope_shape() {
        let err = SandboxError::tool_denied("db.drop", &["db.read".to_string()]);
        let envelope = err.to_envelope();
        assert_eq!(envelope["error"]["type"], "tool_denied");
        let message = envelope["error"]["message"].as_str().unwrap();
        assert!(message.contains("db.drop"));
        assert!(message.contains("db.read"));
    }

    #[test]
    fn test_access_denied_message_format() {
        let err = SandboxError::access_denied("API_KEY", "catalyst:weather.fetcher:1.0.0");
        assert_eq!(
            err.to_string(),
            "access-denied: API_KEY for catalyst:weather.fetcher:1.0.0"
        );
    }

    #[test]
    fn test_request_too_large_names_payload() {
        let err = SandboxError::request_too_large("Multipart body", 2_000_000, 1_048_576);
        assert!(err.to_string().starts_with("Multipart body"));
    }
}
