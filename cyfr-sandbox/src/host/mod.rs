//! Capability layer: the host function surface visible to guest code.
//!
//! - [`installer`] - role-driven import table construction and linker binding
//! - [`http`] - policy-checked outbound HTTP (unary)
//! - [`stream`] - streaming HTTP handles and the per-execution registry
//! - [`mcp`] - policy-checked sub-tool invocation
//! - [`secrets`] - snapshot-backed secret reads (catalysts only)
//! - [`formula`] - recursive component invocation (formulas only)

// Submodules (module declarations only)
pub mod formula;
pub mod http;
pub mod installer;
pub mod mcp;
pub mod secrets;
pub mod stream;

// Re-export the most commonly used types at the module root
pub use formula::SubInvoker;
pub use installer::{CapabilityInstaller, ImportTable, InstallContext, InstalledCapabilities};
pub use stream::StreamRegistry;
