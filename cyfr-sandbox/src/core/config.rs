//! Process-wide sandbox configuration.

// Layer 1: Standard library imports
use std::path::PathBuf;

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};

/// Default fuel budget per execution.
pub const DEFAULT_FUEL_BUDGET: u64 = 100_000_000;

/// Default cap on concurrent streams per execution.
pub const DEFAULT_MAX_STREAMS: usize = 3;

/// Default engine epoch ticker period in milliseconds.
pub const DEFAULT_EPOCH_TICK_MS: u64 = 10;

/// Cap on captured guest stdout/stderr per execution (64 KiB).
pub const DEFAULT_LOG_CAPTURE_BYTES: usize = 64 * 1024;

/// Settings shared by every execution in the process.
///
/// Deserializable with defaults so the embedding process can supply a
/// partial TOML or JSON fragment.
///
/// # Examples
///
/// ```
/// use cyfr_sandbox::core::config::SandboxConfig;
///
/// let config = SandboxConfig::default();
/// assert_eq!(config.default_fuel, 100_000_000);
/// assert_eq!(config.max_streams_per_execution, 3);
/// assert!(!config.allow_reserved_addresses);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Base directory of the canonical local component layout.
    #[serde(default = "default_components_root")]
    pub components_root: PathBuf,

    /// Fuel budget applied to every execution.
    #[serde(default = "default_fuel")]
    pub default_fuel: u64,

    /// Concurrent stream handles per execution.
    #[serde(default = "default_max_streams")]
    pub max_streams_per_execution: usize,

    /// Engine epoch ticker period; wall-clock ceilings are converted to
    /// epoch ticks for pre-emptive interruption of guest code.
    #[serde(default = "default_epoch_tick_ms")]
    pub epoch_tick_ms: u64,

    /// Disable the private/reserved address filter. Development and test
    /// environments only; enabling this is logged at WARN on first use.
    #[serde(default)]
    pub allow_reserved_addresses: bool,

    /// Captured guest stdout/stderr bytes retained per execution.
    #[serde(default = "default_log_capture_bytes")]
    pub log_capture_bytes: usize,
}

fn default_components_root() -> PathBuf {
    PathBuf::from("components")
}

fn default_fuel() -> u64 {
    DEFAULT_FUEL_BUDGET
}

fn default_max_streams() -> usize {
    DEFAULT_MAX_STREAMS
}

fn default_epoch_tick_ms() -> u64 {
    DEFAULT_EPOCH_TICK_MS
}

fn default_log_capture_bytes() -> usize {
    DEFAULT_LOG_CAPTURE_BYTES
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            components_root: default_components_root(),
            default_fuel: DEFAULT_FUEL_BUDGET,
            max_streams_per_execution: DEFAULT_MAX_STREAMS,
            epoch_tick_ms: DEFAULT_EPOCH_TICK_MS,
            allow_reserved_addresses: false,
            log_capture_bytes: DEFAULT_LOG_CAPTURE_BYTES,
        }
    }
}
