//! Actions behind the MCP-style `execution` tool.
//!
//! The RPC transport itself lives outside this crate; these handlers take
//! already-parsed JSON parameters and return the JSON payloads the
//! transport serializes. Error mapping follows the pre-flight rule: a
//! failure before the `started` row carries only an error string, never an
//! execution id.
//!
//! Actions: `run`, `list`, `logs`, `cancel`. Resource renderers back the
//! `opus://executions/{id}` and `opus://executions/{id}/logs` URIs.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use serde::Deserialize;
use serde_json::{json, Value};

// Layer 3: Internal module imports
use crate::core::context::CallerContext;
use crate::core::error::{SandboxError, SandboxResult};
use crate::core::record::{ExecutionRecord, ExecutionStatus};
use crate::core::reference::ComponentRole;
use crate::core::stores::RecordFilter;
use crate::executor::{Executor, RunOptions};

/// Parameters of the `run` action.
#[derive(Debug, Deserialize)]
struct RunParams {
    reference: Option<String>,
    #[serde(default)]
    input: Value,
    #[serde(rename = "type")]
    role: Option<String>,
    /// Identity assertion forwarded with the request. Signature
    /// verification is the registry service's job; the sandbox only logs
    /// that an assertion was present.
    verify: Option<Value>,
}

/// Parameters of the `list` action.
#[derive(Debug, Deserialize)]
struct ListParams {
    status: Option<String>,
    limit: Option<usize>,
}

/// Parameters of the `logs` and `cancel` actions.
#[derive(Debug, Deserialize)]
struct IdParams {
    execution_id: Option<String>,
}

/// Handlers for the `execution` tool.
#[derive(Clone)]
pub struct ExecutionApi {
    executor: Executor,
}

impl ExecutionApi {
    /// Create the handlers over an executor.
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }

    /// `run {reference, input, type?, verify?}`.
    ///
    /// Returns `{execution_id, status, result, component_type,
    /// component_digest, policy_applied}`.
    pub async fn run(&self, ctx: &CallerContext, params: Value) -> SandboxResult<Value> {
        let params: RunParams = parse_params(params)?;
        let reference = params
            .reference
            .ok_or_else(|| SandboxError::invalid_request("missing required field 'reference'"))?;
        let role = params.role.as_deref().map(ComponentRole::parse).transpose()?;
        if params.verify.is_some() {
            tracing::debug!(%reference, "identity assertion forwarded to registry");
        }

        let outcome = self
            .executor
            .run(
                ctx,
                &reference,
                params.input,
                RunOptions {
                    role,
                    parent_execution_id: None,
                },
            )
            .await?;

        let record = self
            .executor
            .journal()
            .get(&ctx.user_id, &outcome.metadata.execution_id)
            .await?;

        Ok(json!({
            "execution_id": outcome.metadata.execution_id,
            "status": outcome.status,
            "result": outcome.output,
            "error_message": outcome.error_message,
            "component_type": record.component_type,
            "component_digest": outcome.metadata.component_digest,
            "policy_applied": outcome.metadata.policy_applied,
        }))
    }

    /// `list {status?, limit?}` for the calling user, newest first.
    pub async fn list(&self, ctx: &CallerContext, params: Value) -> SandboxResult<Value> {
        let params: ListParams = parse_params(params)?;
        let status = params
            .status
            .as_deref()
            .map(parse_status)
            .transpose()?;

        let records = self
            .executor
            .journal()
            .list(&RecordFilter {
                user_id: ctx.user_id.clone(),
                status,
                limit: params.limit,
            })
            .await?;

        let executions: Vec<Value> = records.iter().map(summarize).collect();
        Ok(json!({
            "count": executions.len(),
            "executions": executions,
        }))
    }

    /// `logs {execution_id}`.
    pub async fn logs(&self, ctx: &CallerContext, params: Value) -> SandboxResult<Value> {
        let id = require_id(params)?;
        let record = self.executor.journal().get(&ctx.user_id, &id).await?;
        Ok(json!({
            "execution_id": record.id,
            "status": record.status,
            "logs": record.logs,
            "component_digest": record.component_digest,
            "component_type": record.component_type,
        }))
    }

    /// `cancel {execution_id}`.
    pub async fn cancel(&self, ctx: &CallerContext, params: Value) -> SandboxResult<Value> {
        let id = require_id(params)?;
        self.executor.cancel(ctx, &id).await?;
        Ok(json!({"cancelled": true}))
    }

    /// `opus://executions/{id}`: the full record as JSON.
    pub async fn resource_record(
        &self,
        ctx: &CallerContext,
        execution_id: &str,
    ) -> SandboxResult<Value> {
        let record = self.executor.journal().get(&ctx.user_id, execution_id).await?;
        serde_json::to_value(&record)
            .map_err(|e| SandboxError::store(format!("record encoding failed: {e}")))
    }

    /// `opus://executions/{id}/logs`: human-readable log text.
    pub async fn resource_logs(
        &self,
        ctx: &CallerContext,
        execution_id: &str,
    ) -> SandboxResult<String> {
        let record = self.executor.journal().get(&ctx.user_id, execution_id).await?;
        let mut text = format!(
            "execution {} ({})\nstatus: {}\nstarted: {}\n",
            record.id, record.component_ref, record.status, record.started_at
        );
        if let Some(completed_at) = record.completed_at {
            text.push_str(&format!("completed: {completed_at}\n"));
        }
        if let Some(duration_ms) = record.duration_ms {
            text.push_str(&format!("duration: {duration_ms}ms\n"));
        }
        if let Some(error) = &record.error_message {
            text.push_str(&format!("error: {error}\n"));
        }
        match &record.logs {
            Some(logs) => {
                text.push_str("--- guest output ---\n");
                text.push_str(logs);
                if !logs.ends_with('\n') {
                    text.push('\n');
                }
            }
            None => text.push_str("--- no guest output ---\n"),
        }
        Ok(text)
    }
}

impl std::fmt::Debug for ExecutionApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionApi").finish_non_exhaustive()
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: Value) -> SandboxResult<T> {
    serde_json::from_value(params).map_err(|e| SandboxError::invalid_request(e.to_string()))
}

fn require_id(params: Value) -> SandboxResult<String> {
    let params: IdParams = parse_params(params)?;
    params
        .execution_id
        .ok_or_else(|| SandboxError::invalid_request("missing required field 'execution_id'"))
}

fn parse_status(value: &str) -> SandboxResult<ExecutionStatus> {
    match value {
        "running" => Ok(ExecutionStatus::Running),
        "completed" => Ok(ExecutionStatus::Completed),
        "failed" => Ok(ExecutionStatus::Failed),
        "cancelled" => Ok(ExecutionStatus::Cancelled),
        other => Err(SandboxError::invalid_request(format!(
            "unknown status filter '{other}'"
        ))),
    }
}

fn summarize(record: &ExecutionRecord) -> Value {
    json!({
        "execution_id": record.id,
        "status": record.status,
        "component_ref": record.component_ref,
        "component_type": record.component_type,
        "started_at": record.started_at,
        "completed_at": record.completed_at,
        "duration_ms": record.duration_ms,
        "parent_id": record.parent_id,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::core::config::SandboxConfig;
    use crate::core::policy::Policy;
    use crate::core::reference::ComponentReference;
    use crate::core::stores::{ComponentRegistry, PolicyStore, SecretStore, ToolRouter};
    use crate::journal::memory::MemoryExecutionStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct EmptyPolicies;

    #[async_trait]
    impl PolicyStore for EmptyPolicies {
        async fn policy_for(
            &self,
            _reference: &ComponentReference,
        ) -> SandboxResult<Option<Policy>> {
            Ok(None)
        }
    }

    struct NoSecrets;

    #[async_trait]
    impl SecretStore for NoSecrets {
        async fn granted_secrets(
            &self,
            _reference: &ComponentReference,
        ) -> SandboxResult<HashMap<String, String>> {
            Ok(HashMap::new())
        }
    }

    struct NoRegistry;

    #[async_trait]
    impl ComponentRegistry for NoRegistry {
        async fn fetch(&self, reference: &ComponentReference) -> SandboxResult<Vec<u8>> {
            Err(SandboxError::registry(reference.to_string(), "unavailable"))
        }
    }

    struct NoRouter;

    #[async_trait]
    impl ToolRouter for NoRouter {
        async fn route(&self, tool: &str, action: &str, _args: &Value) -> SandboxResult<Value> {
            Err(SandboxError::dispatch_error(
                format!("{tool}.{action}"),
                "no services wired",
            ))
        }
    }

    fn api() -> ExecutionApi {
        let executor = Executor::builder()
            .config(SandboxConfig::default())
            .policy_store(Arc::new(EmptyPolicies))
            .secret_store(Arc::new(NoSecrets))
            .component_registry(Arc::new(NoRegistry))
            .tool_router(Arc::new(NoRouter))
            .execution_store(Arc::new(MemoryExecutionStore::new()))
            .build()
            .unwrap();
        ExecutionApi::new(executor)
    }

    fn ctx() -> CallerContext {
        CallerContext::new("user-1")
    }

    async fn seed_record(api: &ExecutionApi, user: &str) -> ExecutionRecord {
        let record = ExecutionRecord::started(
            user,
            &ComponentReference::parse("reagent:math.sum:1.0.0").unwrap(),
            "sha256:abcd",
            json!({}),
            "sha256:ef01",
            Policy::default(),
            None,
        );
        api.executor.journal().write_started(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn test_run_requires_reference() {
        let err = api().run(&ctx(), json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[tokio::test]
    async fn test_run_rejects_unknown_role() {
        let err = api()
            .run(
                &ctx(),
                json!({"reference": "r:math.sum:1.0.0", "type": "widget"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_role");
    }

    #[tokio::test]
    async fn test_run_preflight_error_has_no_execution_id() {
        // Registry is unavailable, so resolution fails before any record.
        let err = api()
            .run(&ctx(), json!({"reference": "r:math.sum:1.0.0"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "registry_error");
    }

    #[tokio::test]
    async fn test_list_scopes_to_caller() {
        let api = api();
        seed_record(&api, "user-1").await;
        seed_record(&api, "user-2").await;

        let out = api.list(&ctx(), json!({})).await.unwrap();
        assert_eq!(out["count"], 1);
        assert_eq!(out["executions"][0]["status"], "running");
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let api = api();
        seed_record(&api, "user-1").await;
        let out = api
            .list(&ctx(), json!({"status": "completed"}))
            .await
            .unwrap();
        assert_eq!(out["count"], 0);
    }

    #[tokio::test]
    async fn test_logs_returns_record_fields() {
        let api = api();
        let record = seed_record(&api, "user-1").await;
        let out = api
            .logs(&ctx(), json!({"execution_id": record.id}))
            .await
            .unwrap();
        assert_eq!(out["execution_id"], record.id.as_str());
        assert_eq!(out["component_type"], "reagent");
        assert_eq!(out["component_digest"], "sha256:abcd");
    }

    #[tokio::test]
    async fn test_logs_for_other_user_is_not_found() {
        let api = api();
        let record = seed_record(&api, "user-2").await;
        let err = api
            .logs(&ctx(), json!({"execution_id": record.id}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_is_not_found() {
        let err = api()
            .cancel(&ctx(), json!({"execution_id": "exec_missing"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_cancel_running_crash_leftover_transitions_row() {
        let api = api();
        let record = seed_record(&api, "user-1").await;
        let out = api
            .cancel(&ctx(), json!({"execution_id": record.id}))
            .await
            .unwrap();
        assert_eq!(out, json!({"cancelled": true}));

        let row = api
            .executor
            .journal()
            .get("user-1", &record.id)
            .await
            .unwrap();
        assert_eq!(row.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_terminal_record_is_not_cancellable() {
        let api = api();
        let record = seed_record(&api, "user-1").await;
        api.executor
            .journal()
            .write_completed(&record.id, json!(null), None)
            .await
            .unwrap();

        let err = api
            .cancel(&ctx(), json!({"execution_id": record.id}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_cancellable");
        assert!(err.to_string().contains("completed"));
    }

    #[tokio::test]
    async fn test_resource_logs_renders_text() {
        let api = api();
        let record = seed_record(&api, "user-1").await;
        api.executor
            .journal()
            .write_completed(&record.id, json!({"ok": true}), Some("hello from guest".into()))
            .await
            .unwrap();

        let text = api.resource_logs(&ctx(), &record.id).await.unwrap();
        assert!(text.contains(&record.id));
        assert!(text.contains("status: completed"));
        assert!(text.contains("hello from guest"));
    }
}
