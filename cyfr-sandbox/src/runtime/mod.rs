//! WASM execution layer: Wasmtime integration.
//!
//! - [`engine`] - engine configuration (Component Model, async, fuel, epoch
//!   interruption) and the background epoch ticker
//! - [`limiter`] - per-execution store state and resource ceilings
//! - [`loader`] - reference resolution, byte loading, digest computation

// Submodules (module declarations only)
pub mod engine;
pub mod limiter;
pub mod loader;

// Re-export the most commonly used types at the module root
pub use engine::SandboxEngine;
pub use limiter::{apply_limits_to_store, HostState};
pub use loader::{digest_of, ComponentLoader, ResolvedComponent};
