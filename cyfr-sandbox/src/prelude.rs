//! Common re-exports for ergonomic use of the sandbox core.
//!
//! ```rust,ignore
//! use cyfr_sandbox::prelude::*;
//! ```

pub use crate::api::ExecutionApi;
pub use crate::core::config::SandboxConfig;
pub use crate::core::error::{SandboxError, SandboxResult};
pub use crate::core::policy::{Policy, RateLimit};
pub use crate::core::record::{ExecutionRecord, ExecutionStatus, Outcome};
pub use crate::core::reference::{ComponentReference, ComponentRole};
pub use crate::core::stores::{
    ComponentRegistry, ExecutionStore, PolicyStore, RecordFilter, SecretStore, ToolRouter,
};
pub use crate::core::CallerContext;
pub use crate::executor::{Executor, ExecutorBuilder, RunOptions};
pub use crate::journal::memory::MemoryExecutionStore;
pub use crate::journal::ExecutionJournal;
pub use crate::security::enforcer::PolicyEnforcer;
pub use crate::security::rate_limit::RateLimiter;
