//! Per-component security contracts.
//!
//! A [`Policy`] is retrieved by component reference before execution,
//! snapshotted onto the execution record, and passed by value into every
//! host function closure. A live execution can never observe a mutated
//! policy.
//!
//! Absent fields deserialize to documented defaults, so a policy row can be
//! as small as `{"allowed_domains": ["api.example.com"]}`.

// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
use crate::core::error::SandboxError;

/// Default execution timeout: 30 seconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default linear memory ceiling: 64 MiB.
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

/// Default request-side size cap: 1 MiB.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Default response-side size cap: 5 MiB.
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024;

/// Methods permitted when a policy does not name its own set.
pub const DEFAULT_ALLOWED_METHODS: [&str; 5] = ["GET", "POST", "PUT", "DELETE", "PATCH"];

/// Rate quota: `requests` admitted per `window`.
///
/// The window is a duration literal in `{N}ms|s|m|h` form, e.g. `"1m"` or
/// `"500ms"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Requests admitted per window.
    pub requests: u32,
    /// Window duration literal (`{N}ms|s|m|h`).
    pub window: String,
}

impl RateLimit {
    /// Parse the window literal into a concrete duration.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::InvalidRequest` for malformed literals or a
    /// zero-length window.
    pub fn window_duration(&self) -> Result<Duration, SandboxError> {
        parse_window(&self.window)
    }
}

/// Parse a `{N}ms|s|m|h` duration literal.
pub fn parse_window(literal: &str) -> Result<Duration, SandboxError> {
    // "ms" must be tried before "m" and "s".
    let (digits, unit_ms) = if let Some(n) = literal.strip_suffix("ms") {
        (n, 1u64)
    } else if let Some(n) = literal.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = literal.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = literal.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        return Err(SandboxError::invalid_request(format!(
            "rate window '{literal}' must be {{N}}ms|s|m|h"
        )));
    };

    let n: u64 = digits.parse().map_err(|_| {
        SandboxError::invalid_request(format!("rate window '{literal}' must be {{N}}ms|s|m|h"))
    })?;
    if n == 0 {
        return Err(SandboxError::invalid_request(format!(
            "rate window '{literal}' must be non-zero"
        )));
    }
    Ok(Duration::from_millis(n * unit_ms))
}

/// Immutable per-component security contract.
///
/// # Examples
///
/// ```
/// use cyfr_sandbox::core::policy::Policy;
///
/// let policy: Policy = serde_json::from_str(
///     r#"{"allowed_domains": ["api.example.com"], "timeout_ms": 5000}"#,
/// ).unwrap();
///
/// assert_eq!(policy.allowed_domains, vec!["api.example.com"]);
/// assert_eq!(policy.timeout_ms, 5000);
/// // Unspecified fields take documented defaults
/// assert_eq!(policy.max_memory_bytes, 64 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Hosts the component may reach: exact entries or `*.suffix` wildcards.
    /// Empty means no HTTP at all.
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    /// HTTP methods the component may use (case-insensitive match).
    #[serde(default = "default_methods")]
    pub allowed_methods: Vec<String>,

    /// Optional rate quota shared between pre-flight and in-flight checks.
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,

    /// Wall-clock ceiling per execution, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Linear memory ceiling in bytes.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,

    /// Request-side size cap in bytes (input payload, HTTP bodies).
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,

    /// Response-side size cap in bytes.
    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,

    /// MCP tools the component may call: `service.action` or `service.*`.
    /// Empty means deny-all.
    #[serde(default)]
    pub allowed_tools: Vec<String>,

    /// Storage path prefixes the component may touch. Empty means
    /// unrestricted (writes still confined to the writable namespace).
    #[serde(default)]
    pub allowed_storage_paths: Vec<String>,
}

fn default_methods() -> Vec<String> {
    DEFAULT_ALLOWED_METHODS.iter().map(|m| (*m).to_owned()).collect()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_memory_bytes() -> u64 {
    DEFAULT_MAX_MEMORY_BYTES
}

fn default_max_request_size() -> usize {
    DEFAULT_MAX_REQUEST_SIZE
}

fn default_max_response_size() -> usize {
    DEFAULT_MAX_RESPONSE_SIZE
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            allowed_methods: default_methods(),
            rate_limit: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            allowed_tools: Vec::new(),
            allowed_storage_paths: Vec::new(),
        }
    }
}

impl Policy {
    /// Wall-clock ceiling as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
