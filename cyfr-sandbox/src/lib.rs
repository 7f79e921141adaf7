//! # cyfr-sandbox - Execution Sandbox Core for CYFR
//!
//! This crate executes untrusted WebAssembly components on behalf of
//! authenticated users. For every invocation it:
//! - Loads a component binary and classifies it by role
//! - Installs a role-scoped set of host capabilities (deny-by-default)
//! - Evaluates the per-component security policy on every capability call
//! - Records a crash-resilient execution trace in the journal
//! - Enforces memory, fuel, wall-clock, stream, and rate ceilings
//!
//! ## Architecture
//!
//! The crate is organized into seven root modules:
//!
//! - **core/** - Foundation: shared types and abstractions (imports nothing internal)
//! - **security/** - Policy evaluation, rate limiting, secret masking, IP guard (imports core/)
//! - **runtime/** - WASM execution: Wasmtime integration (imports core/, security/)
//! - **host/** - Capability installer and host function bodies (imports core/, security/, runtime/)
//! - **journal/** - Execution lifecycle records (imports core/, security/)
//! - **executor/** - End-to-end invocation pipeline (imports everything below it)
//! - **api/** - `execution` tool actions consumed by the external RPC layer (imports executor/, journal/)
//!
//! ## Dependency Rules (MANDATORY)
//!
//! ```text
//! api/ ──► executor/ ──► host/ ──► runtime/ ──► security/ ──► core/
//!   │          │           │          │              │            │
//!   └──────────┴───────────┴──────────┴──────────────┴────────────┘
//!                      All can import from core/
//! ```
//!
//! Lower layers never import higher ones. `core/` imports no internal module.
//!
//! ## Roles
//!
//! Capability installation is table-driven on [`core::ComponentRole`]:
//!
//! - **Catalyst**: host-mediated outbound HTTP, granted secrets, MCP tools
//! - **Reagent**: pure computation, no capabilities beyond stdout/stderr
//! - **Formula**: MCP tools plus recursive component invocation
//!
//! Outbound HTTP is always mediated by host functions - native WASI HTTP is
//! never linked - so policy checks, DNS validation, size limits, and body
//! encodings live in one code path.
//!
//! ## Getting Started
//!
//! ```rust,ignore
//! use cyfr_sandbox::prelude::*;
//!
//! let executor = Executor::builder()
//!     .config(SandboxConfig::default())
//!     .policy_store(policies)
//!     .secret_store(secrets)
//!     .component_registry(registry)
//!     .tool_router(router)
//!     .execution_store(store)
//!     .build()?;
//!
//! let outcome = executor
//!     .run(&ctx, "r:math.sum:1.0.0", json!({"a": 5, "b": 3}), RunOptions::default())
//!     .await?;
//! ```

// Foundation layer (no internal dependencies)
pub mod core;

// Security layer (imports from core/)
pub mod security;

// WASM execution layer (imports from core/, security/)
pub mod runtime;

// Capability layer (imports from core/, security/, runtime/)
pub mod host;

// Lifecycle records (imports from core/, security/)
pub mod journal;

// Invocation pipeline (imports from all lower layers)
pub mod executor;

// RPC-facing actions (imports from executor/, journal/)
pub mod api;

// Prelude - common re-exports for ergonomic API
pub mod prelude;
