//! Policy-checked MCP sub-tool invocation.
//!
//! The `call` host function routes `{tool, action, args}` requests to the
//! external tool services, after the policy's `allowed_tools` glob check
//! and - for storage tools - the storage-path checks. One telemetry event
//! is emitted per call with the tool name, status, and duration.

// Layer 1: Standard library imports
use std::sync::Arc;
use std::time::Instant;

// Layer 2: Third-party crate imports
use serde::Deserialize;
use serde_json::Value;

// Layer 3: Internal module imports
use crate::core::error::{SandboxError, SandboxResult};
use crate::core::policy::Policy;
use crate::core::reference::ComponentReference;
use crate::core::stores::ToolRouter;
use crate::security::enforcer::PolicyEnforcer;
use crate::security::masking::SecretMasker;

/// Tool name whose paths are subject to storage-path policy.
const STORAGE_TOOL: &str = "storage";

/// Write namespace for storage tools when the policy does not override
/// the allowed paths.
const WRITABLE_NAMESPACE: &str = "agent/";

/// Actions that mutate storage and are confined to the writable namespace.
const WRITE_ACTIONS: [&str; 3] = ["write", "append", "delete"];

/// Wire shape of one guest tool call.
#[derive(Debug, Deserialize)]
struct ToolCallSpec {
    tool: Option<String>,
    action: Option<String>,
    #[serde(default)]
    args: Value,
}

/// Host-side MCP dispatcher for one execution.
pub struct McpDispatcher {
    policy: Policy,
    execution_id: String,
    reference: ComponentReference,
    router: Arc<dyn ToolRouter>,
    masker: Arc<SecretMasker>,
}

impl McpDispatcher {
    /// Create a dispatcher bound to one execution's context.
    pub fn new(
        policy: Policy,
        execution_id: String,
        reference: ComponentReference,
        router: Arc<dyn ToolRouter>,
        masker: Arc<SecretMasker>,
    ) -> Self {
        Self {
            policy,
            execution_id,
            reference,
            router,
            masker,
        }
    }

    /// `call` host function body: JSON in, JSON out, errors as envelopes.
    pub async fn dispatch(&self, request_json: String) -> String {
        let started = Instant::now();
        let (label, result) = match self.execute(&request_json).await {
            Ok((label, value)) => (label, Ok(value)),
            Err((label, err)) => (label, Err(err)),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                tracing::info!(
                    execution_id = %self.execution_id,
                    tool = %label,
                    duration_ms,
                    status = "ok",
                    "mcp dispatch"
                );
                self.masker.mask_value(&value).to_string()
            }
            Err(err) => {
                tracing::info!(
                    execution_id = %self.execution_id,
                    tool = %label,
                    duration_ms,
                    status = err.kind(),
                    "mcp dispatch"
                );
                self.masker.mask_value(&err.to_envelope()).to_string()
            }
        }
    }

    /// Parse, policy-check, and route one call. The dotted tool label is
    /// returned either way so telemetry can name the call.
    async fn execute(&self, request_json: &str) -> Result<(String, Value), (String, SandboxError)> {
        let spec: ToolCallSpec = match serde_json::from_str(request_json) {
            Ok(spec) => spec,
            Err(e) => {
                return Err((
                    "unparsed".to_owned(),
                    SandboxError::invalid_json(e.to_string()),
                ));
            }
        };

        let (tool, action) = match (spec.tool, spec.action) {
            (Some(tool), Some(action)) if !tool.is_empty() && !action.is_empty() => (tool, action),
            _ => {
                return Err((
                    "unparsed".to_owned(),
                    SandboxError::invalid_request("both 'tool' and 'action' are required"),
                ));
            }
        };
        let label = format!("{tool}.{action}");

        self.check(&tool, &action, &label, &spec.args)
            .map_err(|e| (label.clone(), e))?;

        match self.router.route(&tool, &action, &spec.args).await {
            Ok(value) => Ok((label, value)),
            Err(err) => Err((label, err)),
        }
    }

    fn check(&self, tool: &str, action: &str, label: &str, args: &Value) -> SandboxResult<()> {
        PolicyEnforcer::check_tool(&self.policy, label)?;

        if tool == STORAGE_TOOL {
            let path = args
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    SandboxError::invalid_request("storage calls require a string 'path' argument")
                })?;
            PolicyEnforcer::check_storage_path(&self.policy, path)?;

            // Writes stay inside the writable namespace unless the policy
            // overrides the allowed paths explicitly.
            if WRITE_ACTIONS.contains(&action)
                && self.policy.allowed_storage_paths.is_empty()
                && !path.starts_with(WRITABLE_NAMESPACE)
            {
                return Err(SandboxError::storage_path_denied(
                    path,
                    &[WRITABLE_NAMESPACE.to_owned()],
                ));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for McpDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpDispatcher")
            .field("execution_id", &self.execution_id)
            .field("reference", &self.reference.to_string())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoRouter;

    #[async_trait]
    impl ToolRouter for EchoRouter {
        async fn route(&self, tool: &str, action: &str, args: &Value) -> SandboxResult<Value> {
            if tool == "unknown" {
                return Err(SandboxError::dispatch_error(
                    format!("{tool}.{action}"),
                    "no such tool",
                ));
            }
            Ok(json!({"tool": tool, "action": action, "args": args}))
        }
    }

    fn dispatcher(policy: Policy) -> McpDispatcher {
        McpDispatcher::new(
            policy,
            "exec_test".to_owned(),
            ComponentReference::parse("formula:pipeline.report:1.0.0").unwrap(),
            Arc::new(EchoRouter),
            Arc::new(SecretMasker::default()),
        )
    }

    fn tools(entries: &[&str]) -> Policy {
        Policy {
            allowed_tools: entries.iter().map(|s| (*s).to_owned()).collect(),
            ..Policy::default()
        }
    }

    #[tokio::test]
    async fn test_empty_allowed_tools_denies_everything() {
        let out = dispatcher(Policy::default())
            .dispatch(json!({"tool": "storage", "action": "read", "args": {"path": "agent/x"}}).to_string())
            .await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "tool_denied");
    }

    #[tokio::test]
    async fn test_service_wildcard_allows_and_routes() {
        let out = dispatcher(tools(&["search.*"]))
            .dispatch(json!({"tool": "search", "action": "query", "args": {"q": "x"}}).to_string())
            .await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["tool"], "search");
        assert_eq!(value["action"], "query");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_dispatch_error() {
        let out = dispatcher(tools(&["unknown.*"]))
            .dispatch(json!({"tool": "unknown", "action": "anything"}).to_string())
            .await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "dispatch_error");
    }

    #[tokio::test]
    async fn test_missing_fields_are_invalid_request() {
        let out = dispatcher(tools(&["search.*"]))
            .dispatch(json!({"tool": "search"}).to_string())
            .await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "invalid_request");
    }

    #[tokio::test]
    async fn test_storage_read_outside_allowed_paths_is_denied() {
        let policy = Policy {
            allowed_storage_paths: vec!["agent/".to_owned()],
            ..tools(&["storage.*"])
        };
        let out = dispatcher(policy)
            .dispatch(
                json!({"tool": "storage", "action": "read", "args": {"path": "other/file"}})
                    .to_string(),
            )
            .await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "storage_path_denied");
    }

    #[tokio::test]
    async fn test_storage_write_confined_to_agent_namespace() {
        let out = dispatcher(tools(&["storage.*"]))
            .dispatch(
                json!({"tool": "storage", "action": "write", "args": {"path": "shared/file", "data": "x"}})
                    .to_string(),
            )
            .await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "storage_path_denied");
        assert!(value["error"]["message"].as_str().unwrap().contains("agent/"));
    }

    #[tokio::test]
    async fn test_storage_write_inside_agent_namespace_routes() {
        let out = dispatcher(tools(&["storage.*"]))
            .dispatch(
                json!({"tool": "storage", "action": "write", "args": {"path": "agent/notes", "data": "x"}})
                    .to_string(),
            )
            .await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["tool"], "storage");
    }

    #[tokio::test]
    async fn test_policy_paths_override_write_namespace() {
        let policy = Policy {
            allowed_storage_paths: vec!["shared/".to_owned()],
            ..tools(&["storage.*"])
        };
        let out = dispatcher(policy)
            .dispatch(
                json!({"tool": "storage", "action": "write", "args": {"path": "shared/file", "data": "x"}})
                    .to_string(),
            )
            .await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["tool"], "storage");
    }

    #[tokio::test]
    async fn test_storage_call_without_path_is_invalid() {
        let out = dispatcher(tools(&["storage.*"]))
            .dispatch(json!({"tool": "storage", "action": "read", "args": {}}).to_string())
            .await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "invalid_request");
    }
}
