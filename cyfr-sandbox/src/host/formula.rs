//! Recursive component invocation for formulas.
//!
//! The `call` host function is installed only for formulas. A call invokes
//! the executor recursively with `parent_execution_id` set to the current
//! execution, so the journal links parent and child records. The child
//! gets the fresh budget of its own policy - nothing is inherited from the
//! parent - and cycles are permitted only to the extent that the timeout
//! and fuel budgets allow them to terminate.
//!
//! The executor implements [`SubInvoker`]; the trait keeps this layer from
//! importing the executor directly.

// Layer 1: Standard library imports
use std::sync::Arc;
use std::time::Instant;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

// Layer 3: Internal module imports
use crate::core::error::{SandboxError, SandboxResult};
use crate::core::reference::ComponentRole;
use crate::security::masking::SecretMasker;

/// Callback into the executor for recursive invocations.
#[async_trait]
pub trait SubInvoker: Send + Sync {
    /// Run a child execution on behalf of `user_id`, linked to the parent.
    ///
    /// Returns the child's outcome as JSON (including
    /// `metadata.execution_id`).
    async fn invoke_child(
        &self,
        parent_execution_id: &str,
        user_id: &str,
        reference: &str,
        input: Value,
        role: Option<ComponentRole>,
    ) -> SandboxResult<Value>;
}

/// Wire shape of one guest invoke request.
#[derive(Debug, Deserialize)]
struct InvokeSpec {
    reference: Option<String>,
    #[serde(default)]
    input: Value,
    #[serde(rename = "type")]
    role: Option<String>,
}

/// Host-side recursive invoker for one formula execution.
pub struct FormulaInvoker {
    invoker: Arc<dyn SubInvoker>,
    execution_id: String,
    user_id: String,
    masker: Arc<SecretMasker>,
}

impl FormulaInvoker {
    /// Create an invoker bound to one execution's context.
    pub fn new(
        invoker: Arc<dyn SubInvoker>,
        execution_id: String,
        user_id: String,
        masker: Arc<SecretMasker>,
    ) -> Self {
        Self {
            invoker,
            execution_id,
            user_id,
            masker,
        }
    }

    /// `call` host function body: JSON in, JSON out, errors as envelopes.
    pub async fn call(&self, request_json: String) -> String {
        let started = Instant::now();
        match self.execute(&request_json).await {
            Ok(outcome) => {
                let child_id = outcome
                    .pointer("/metadata/execution_id")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let status = outcome
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                tracing::info!(
                    parent_id = %self.execution_id,
                    child_id,
                    status,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "formula sub-invocation"
                );
                self.masker.mask_value(&outcome).to_string()
            }
            Err(err) => {
                tracing::info!(
                    parent_id = %self.execution_id,
                    status = err.kind(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "formula sub-invocation"
                );
                self.masker.mask_value(&err.to_envelope()).to_string()
            }
        }
    }

    async fn execute(&self, request_json: &str) -> SandboxResult<Value> {
        let spec: InvokeSpec = serde_json::from_str(request_json)
            .map_err(|e| SandboxError::invalid_json(e.to_string()))?;

        let reference = spec
            .reference
            .ok_or_else(|| SandboxError::invalid_request("missing required field 'reference'"))?;
        let role = spec.role.as_deref().map(ComponentRole::parse).transpose()?;

        self.invoker
            .invoke_child(
                &self.execution_id,
                &self.user_id,
                &reference,
                spec.input,
                role,
            )
            .await
    }
}

impl std::fmt::Debug for FormulaInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormulaInvoker")
            .field("execution_id", &self.execution_id)
            .finish_non_exhaustive()
    }
}
