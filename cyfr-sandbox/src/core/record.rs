//! Execution lifecycle records and invocation outcomes.
//!
//! One [`ExecutionRecord`] captures the full lifecycle of a single
//! invocation. The record is inserted in `Running` state strictly before
//! any capability is installed and receives exactly one terminal status
//! afterwards. A record still `Running` after a host restart is a crash
//! indicator, not an in-progress execution.

// Layer 1: Standard library imports
use std::fmt;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// Layer 3: Internal module imports
use crate::core::policy::Policy;
use crate::core::reference::{ComponentReference, ComponentRole};

/// Lifecycle status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Started record written, terminal record not yet written.
    Running,
    /// Guest returned normally; output captured and masked.
    Completed,
    /// Guest trapped, exhausted a resource ceiling, or timed out.
    Failed,
    /// Explicit cancel or teardown cancel.
    Cancelled,
}

impl ExecutionStatus {
    /// Lowercase status string as stored and logged.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this status is terminal (exactly one terminal write per record).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a fresh execution id in the `exec_<uuid>` form.
pub fn new_execution_id() -> String {
    format!("exec_{}", Uuid::new_v4())
}

/// Durable row capturing one invocation's lifecycle.
///
/// Secret values never appear in `output`, `error_message`, or `logs`;
/// they are masked on the egress path before the record is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// `exec_<uuid>` identifier.
    pub id: String,

    /// Parent execution id when invoked by a formula.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Owner of the invocation; reads are always scoped to this user.
    pub user_id: String,

    /// Canonical component reference string.
    pub component_ref: String,

    /// Role the component executed under.
    pub component_type: ComponentRole,

    /// `sha256:<hex>` digest of the loaded bytes.
    pub component_digest: String,

    /// Set strictly before any capability is installed.
    pub started_at: DateTime<Utc>,

    /// Set together with the terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Current lifecycle status.
    pub status: ExecutionStatus,

    /// Input payload (already masked where applicable).
    pub input: Value,

    /// `sha256:<hex>` digest of the serialized input.
    pub input_digest: String,

    /// Masked output for completed executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Masked failure message for failed executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Policy in force for the whole execution, snapshotted at start.
    pub policy_snapshot: Policy,

    /// Wall-clock duration, set with the terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Masked tail of the guest's stdout/stderr, set with the terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
}

impl ExecutionRecord {
    /// Create a fresh `Running` record for an invocation that is about to
    /// install capabilities.
    pub fn started(
        user_id: impl Into<String>,
        reference: &ComponentReference,
        component_digest: impl Into<String>,
        input: Value,
        input_digest: impl Into<String>,
        policy_snapshot: Policy,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            id: new_execution_id(),
            parent_id,
            user_id: user_id.into(),
            component_ref: reference.to_string(),
            component_type: reference.role,
            component_digest: component_digest.into(),
            started_at: Utc::now(),
            completed_at: None,
            status: ExecutionStatus::Running,
            input,
            input_digest: input_digest.into(),
            output: None,
            error_message: None,
            policy_snapshot,
            duration_ms: None,
            logs: None,
        }
    }
}

/// Result of one invocation as returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    /// Terminal status of the execution.
    pub status: ExecutionStatus,
    /// Masked output, present for completed executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Masked failure message for failed/cancelled executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Execution metadata.
    pub metadata: OutcomeMetadata,
}

/// Metadata attached to every outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeMetadata {
    /// `exec_<uuid>` id of the journal record.
    pub execution_id: String,
    /// `sha256:<hex>` digest of the executed bytes.
    pub component_digest: String,
    /// Whether a stored policy row was found (as opposed to defaults).
    pub policy_applied: bool,
    /// Wall-clock duration of the execution.
    pub duration_ms: u64,
}
