//! Interfaces to external collaborators.
//!
//! The sandbox core consumes five external services through these traits:
//! the policy store, the secret store, the component registry, the MCP tool
//! router, and the execution store. The production implementations (SQLite
//! persistence, OCI transport, encrypted secrets) live outside this crate;
//! tests use in-memory doubles.
//!
//! Every trait is object-safe and `Send + Sync` so implementations can be
//! shared across execution tasks behind `Arc<dyn ...>`.

// Layer 1: Standard library imports
use std::collections::HashMap;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use serde_json::Value;

// Layer 3: Internal module imports
use crate::core::error::SandboxResult;
use crate::core::policy::Policy;
use crate::core::record::{ExecutionRecord, ExecutionStatus};
use crate::core::reference::ComponentReference;

/// Source of per-component security policies.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Fetch the policy row for a component, if one exists.
    async fn policy_for(&self, reference: &ComponentReference) -> SandboxResult<Option<Policy>>;
}

/// Source of resolved secret grants.
///
/// Returns the full `name -> value` map of secrets currently granted to the
/// component. Decryption happens behind this trait; the sandbox only ever
/// sees plaintext values inside a per-execution snapshot.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Resolve all secrets granted to `reference`.
    async fn granted_secrets(
        &self,
        reference: &ComponentReference,
    ) -> SandboxResult<HashMap<String, String>>;
}

/// Source of component binaries for registry-form references.
#[async_trait]
pub trait ComponentRegistry: Send + Sync {
    /// Fetch the component bytes for a canonical reference.
    async fn fetch(&self, reference: &ComponentReference) -> SandboxResult<Vec<u8>>;
}

/// Router to the external MCP tool services.
#[async_trait]
pub trait ToolRouter: Send + Sync {
    /// Route a policy-approved `tool.action` call to its service.
    async fn route(&self, tool: &str, action: &str, args: &Value) -> SandboxResult<Value>;
}

/// Filter for [`ExecutionStore::list`].
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Owner scope; `list` never crosses users.
    pub user_id: String,
    /// Optional status filter.
    pub status: Option<ExecutionStatus>,
    /// Optional result cap (newest first).
    pub limit: Option<usize>,
}

impl RecordFilter {
    /// Filter scoped to one user with no further constraints.
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            status: None,
            limit: None,
        }
    }
}

/// Durable persistence for execution records.
///
/// Each journal call translates to a single durable write here. `insert` is
/// the `started` write; `update` is the idempotent terminal write keyed on
/// `record.id`. Transition legality is the journal's job, not the store's.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a fresh `Running` record. Fails on duplicate id.
    async fn insert(&self, record: &ExecutionRecord) -> SandboxResult<()>;

    /// Overwrite the record with the same id.
    async fn update(&self, record: &ExecutionRecord) -> SandboxResult<()>;

    /// Fetch a record by id, regardless of owner. Callers scope by user.
    async fn fetch(&self, id: &str) -> SandboxResult<Option<ExecutionRecord>>;

    /// List records matching the filter, newest first.
    async fn list(&self, filter: &RecordFilter) -> SandboxResult<Vec<ExecutionRecord>>;
}
