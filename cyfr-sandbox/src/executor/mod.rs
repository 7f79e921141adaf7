//! End-to-end invocation pipeline.
//!
//! [`Executor::run`] orchestrates one invocation in strict order:
//!
//! 1. Normalize the reference (string, shorthand, or local path)
//! 2. Resolve bytes and compute the `sha256` digest
//! 3. Validate input size against the policy's `max_request_size`
//! 4. Select the role (caller hint, default reagent)
//! 5. Policy gate: catalysts need a policy with non-empty `allowed_domains`
//! 6. Rate-limit check for `(user, reference)`
//! 7. Write the `started` journal row
//! 8. Install role-scoped capabilities and the per-execution registries
//! 9. Run the guest entry function under fuel, memory, epoch, and
//!    wall-clock ceilings on a cancellable task
//! 10. Mask and size-check the output
//! 11. Write exactly one terminal journal row
//! 12. Unconditionally tear down: release streams, drop the cancellation
//!     registration, emit telemetry
//!
//! Steps 1-6 produce no side effects; pre-flight failures surface as plain
//! errors with no execution id. Once the `started` row exists, every path
//! writes exactly one terminal row, and step 12 always runs.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use wasmtime::component::Linker;
use wasmtime::Store;

// Layer 3: Internal module imports
use crate::core::config::SandboxConfig;
use crate::core::context::CallerContext;
use crate::core::error::{SandboxError, SandboxResult};
use crate::core::policy::Policy;
use crate::core::record::{ExecutionRecord, ExecutionStatus, Outcome, OutcomeMetadata};
use crate::core::reference::{ComponentReference, ComponentRole};
use crate::core::stores::{
    ComponentRegistry, ExecutionStore, PolicyStore, SecretStore, ToolRouter,
};
use crate::host::installer::{bind_imports, CapabilityInstaller, ImportTable, InstallContext};
use crate::host::formula::SubInvoker;
use crate::journal::ExecutionJournal;
use crate::runtime::engine::SandboxEngine;
use crate::runtime::limiter::{apply_limits_to_store, HostState};
use crate::runtime::loader::{digest_of, ComponentLoader};
use crate::security::enforcer::PolicyEnforcer;
use crate::security::masking::SecretMasker;
use crate::security::rate_limit::RateLimiter;

/// Exported entry function every component implements:
/// `run: (string) -> string`, JSON both ways.
pub const ENTRY_FUNCTION: &str = "run";

/// Caller-supplied options for one invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Role hint; `None` means reagent.
    pub role: Option<ComponentRole>,
    /// Set when invoked by a formula; links the journal records.
    pub parent_execution_id: Option<String>,
}

/// Result of the guest call proper, with whatever stdout/stderr survived.
struct GuestRun {
    result: SandboxResult<String>,
    logs: Option<String>,
}

/// How step 9 ended.
enum GuestEnd {
    Finished(GuestRun),
    TimedOut,
    Cancelled,
}

/// Orchestrates invocations end-to-end.
///
/// Cheap to clone; executions running in parallel share the engine, the
/// rate buckets, and the journal, and nothing else.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    config: SandboxConfig,
    engine: SandboxEngine,
    loader: ComponentLoader,
    enforcer: PolicyEnforcer,
    rate: Arc<RateLimiter>,
    installer: CapabilityInstaller,
    journal: ExecutionJournal,
    secrets: Arc<dyn SecretStore>,
    /// Live cancellation triggers, keyed by execution id.
    cancellations: DashMap<String, CancellationToken>,
}

impl Executor {
    /// Start assembling an executor.
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    /// The journal, for read-side consumers (list/logs APIs).
    pub fn journal(&self) -> &ExecutionJournal {
        &self.inner.journal
    }

    /// The shared rate limiter, for status/reset RPCs.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.rate
    }

    /// The policy enforcer, for read-side consumers.
    pub fn enforcer(&self) -> &PolicyEnforcer {
        &self.inner.enforcer
    }

    /// Run one component invocation end-to-end.
    ///
    /// Pre-flight failures (steps 1-6) return `Err` and write nothing.
    /// Once the `started` row exists, the result is `Ok(Outcome)` whose
    /// status reports completion, failure, or cancellation.
    pub async fn run(
        &self,
        ctx: &CallerContext,
        target: &str,
        input: Value,
        opts: RunOptions,
    ) -> SandboxResult<Outcome> {
        // Steps 1-2: normalize and resolve. No side effects.
        let resolved = self.inner.loader.resolve(target).await?;
        let reference = resolved.reference.clone();

        // Step 4 (role) happens before 3/5 only in the sense of defaulting;
        // error precedence follows the pipeline order.
        let role = opts.role.unwrap_or(ComponentRole::Reagent);

        let (policy, policy_applied) = self.inner.enforcer.get_effective(&reference).await?;

        // Step 3: input size against the effective policy.
        let input_serialized = input.to_string();
        if input_serialized.len() > policy.max_request_size {
            return Err(SandboxError::request_too_large(
                "Input",
                input_serialized.len(),
                policy.max_request_size,
            ));
        }

        // Step 5: the role gate.
        PolicyEnforcer::check_role_gate(&reference, role, &policy, policy_applied)?;

        // Step 6: one token from the shared bucket.
        self.inner
            .rate
            .check(&ctx.user_id, &reference, &policy)?;

        // Step 7: the `started` row. First side effect.
        let secrets = self.resolve_secrets(&reference, role).await?;
        let masker = Arc::new(SecretMasker::new(secrets.values()));
        let record = ExecutionRecord::started(
            &ctx.user_id,
            &reference,
            resolved.digest.clone(),
            input,
            digest_of(input_serialized.as_bytes()),
            policy.clone(),
            opts.parent_execution_id,
        );
        self.inner.journal.write_started(&record).await?;
        tracing::info!(
            execution_id = %record.id,
            reference = %reference,
            role = %role,
            user_id = %ctx.user_id,
            "execution started"
        );

        // Step 8: capabilities and the cancellation trigger.
        let token = CancellationToken::new();
        self.inner
            .cancellations
            .insert(record.id.clone(), token.clone());
        let installed = self.inner.installer.install(InstallContext {
            execution_id: record.id.clone(),
            user_id: ctx.user_id.clone(),
            reference: reference.clone(),
            policy: policy.clone(),
            role,
            secrets: Arc::new(secrets),
            masker: Arc::clone(&masker),
            sub_invoker: Arc::new(self.clone()),
        });

        // Steps 9-11 under a guard; step 12 runs regardless.
        let finished = self
            .execute_and_journal(
                &record,
                &policy,
                installed.table,
                resolved.bytes,
                &masker,
                token.clone(),
                input_serialized,
            )
            .await;

        // Step 12: unconditional teardown.
        installed.streams.close_all().await;
        self.inner.cancellations.remove(&record.id);

        let final_record = finished?;
        tracing::info!(
            execution_id = %final_record.id,
            status = %final_record.status,
            duration_ms = final_record.duration_ms.unwrap_or(0),
            "execution finished"
        );
        Ok(Self::outcome_from(&final_record, policy_applied))
    }

    /// Cancel a running execution.
    ///
    /// Flips the execution's cancellation trigger; the running task writes
    /// the terminal `Cancelled` row before it is reaped. For a `Running`
    /// row with no live task (a crash leftover), the row is transitioned
    /// directly.
    ///
    /// # Errors
    ///
    /// - `SandboxError::NotFound` for unknown ids or other users' records
    /// - `SandboxError::NotCancellable` when the record is already terminal
    pub async fn cancel(&self, ctx: &CallerContext, execution_id: &str) -> SandboxResult<()> {
        let record = self.inner.journal.get(&ctx.user_id, execution_id).await?;
        if record.status != ExecutionStatus::Running {
            return Err(SandboxError::NotCancellable {
                id: execution_id.to_owned(),
                status: record.status.to_string(),
            });
        }
        match self.inner.cancellations.get(execution_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => {
                // No live task: a crash leftover. Transition the row.
                self.inner
                    .journal
                    .write_cancelled(execution_id, None)
                    .await?;
                Ok(())
            }
        }
    }

    /// Steps 9-11: run the guest and write exactly one terminal row.
    #[allow(clippy::too_many_arguments)]
    async fn execute_and_journal(
        &self,
        record: &ExecutionRecord,
        policy: &Policy,
        table: ImportTable,
        bytes: Vec<u8>,
        masker: &SecretMasker,
        token: CancellationToken,
        input_serialized: String,
    ) -> SandboxResult<ExecutionRecord> {
        let guest = self.run_guest(policy, table, bytes, input_serialized);

        let end = tokio::select! {
            biased;
            () = token.cancelled() => GuestEnd::Cancelled,
            result = tokio::time::timeout(policy.timeout(), guest) => match result {
                Ok(run) => GuestEnd::Finished(run),
                Err(_) => GuestEnd::TimedOut,
            },
        };

        let journal = &self.inner.journal;
        let written = match end {
            GuestEnd::Cancelled => journal.write_cancelled(&record.id, None).await,
            GuestEnd::TimedOut => {
                journal
                    .write_failed(&record.id, "timeout".to_owned(), None)
                    .await
            }
            GuestEnd::Finished(run) => {
                let logs = run.logs.map(|l| masker.mask_str(&l));
                match run
                    .result
                    .and_then(|raw| Self::parse_output(&raw, policy))
                {
                    Ok(parsed) => {
                        journal
                            .write_completed(&record.id, masker.mask_value(&parsed), logs)
                            .await
                    }
                    Err(err) => {
                        journal
                            .write_failed(&record.id, masker.mask_error(&err.to_string()), logs)
                            .await
                    }
                }
            }
        };

        // An explicit cancel can win the terminal transition between the
        // guest finishing and our write; surface the winner's row.
        match written {
            Err(SandboxError::InvalidTransition { .. }) => {
                journal.get(&record.user_id, &record.id).await
            }
            other => other,
        }
    }

    /// Step 9 proper: instantiate and call the entry function.
    async fn run_guest(
        &self,
        policy: &Policy,
        table: ImportTable,
        bytes: Vec<u8>,
        input_serialized: String,
    ) -> GuestRun {
        let engine = &self.inner.engine;
        let config = &self.inner.config;

        let (component, linker) = match self.prepare_instance(&bytes, &table) {
            Ok(pair) => pair,
            Err(err) => {
                return GuestRun {
                    result: Err(err),
                    logs: None,
                };
            }
        };

        let mut store = Store::new(engine.engine(), HostState::new(config.log_capture_bytes));
        if let Err(err) = apply_limits_to_store(
            &mut store,
            policy,
            config.default_fuel,
            engine.ticks_for_timeout(policy.timeout()),
        ) {
            return GuestRun {
                result: Err(err),
                logs: None,
            };
        }

        let result = async {
            let instance = linker
                .instantiate_async(&mut store, &component)
                .await
                .map_err(|e| {
                    SandboxError::execution_failed(format!("failed to instantiate component: {e}"))
                })?;
            let func = instance
                .get_typed_func::<(String,), (String,)>(&mut store, ENTRY_FUNCTION)
                .map_err(|e| {
                    SandboxError::execution_failed(format!(
                        "entry function '{ENTRY_FUNCTION}' not found or has wrong type: {e}"
                    ))
                })?;
            let (output,) = func
                .call_async(&mut store, (input_serialized,))
                .await
                .map_err(classify_guest_error)?;
            func.post_return_async(&mut store)
                .await
                .map_err(|e| SandboxError::execution_failed(format!("post-return failed: {e}")))?;
            Ok(output)
        }
        .await;

        let logs = store.data().captured_logs();
        GuestRun { result, logs }
    }

    /// Compile the component and assemble its linker: the WASI
    /// stdout/stderr surface plus the role-scoped import table.
    fn prepare_instance(
        &self,
        bytes: &[u8],
        table: &ImportTable,
    ) -> SandboxResult<(wasmtime::component::Component, Linker<HostState>)> {
        let engine = &self.inner.engine;
        let component = engine.load_component(bytes)?;
        let mut linker = Linker::<HostState>::new(engine.engine());
        wasmtime_wasi::add_to_linker_async(&mut linker)
            .map_err(|e| SandboxError::engine(format!("failed to link WASI: {e}")))?;
        bind_imports(&mut linker, table)?;
        Ok((component, linker))
    }

    /// Step 10: size-check and parse the guest's returned JSON.
    fn parse_output(raw: &str, policy: &Policy) -> SandboxResult<Value> {
        if raw.len() > policy.max_response_size {
            return Err(SandboxError::ResponseTooLarge {
                limit: policy.max_response_size,
            });
        }
        serde_json::from_str(raw).map_err(|e| {
            SandboxError::execution_failed(format!("component returned invalid JSON: {e}"))
        })
    }

    /// Secrets snapshot: catalysts get their grants resolved once; other
    /// roles never see secret values even when grants exist.
    async fn resolve_secrets(
        &self,
        reference: &ComponentReference,
        role: ComponentRole,
    ) -> SandboxResult<HashMap<String, String>> {
        if role == ComponentRole::Catalyst {
            self.inner.secrets.granted_secrets(reference).await
        } else {
            Ok(HashMap::new())
        }
    }

    fn outcome_from(record: &ExecutionRecord, policy_applied: bool) -> Outcome {
        Outcome {
            status: record.status,
            output: record.output.clone(),
            error_message: record.error_message.clone(),
            metadata: OutcomeMetadata {
                execution_id: record.id.clone(),
                component_digest: record.component_digest.clone(),
                policy_applied,
                duration_ms: record.duration_ms.unwrap_or(0),
            },
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("live_executions", &self.inner.cancellations.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SubInvoker for Executor {
    async fn invoke_child(
        &self,
        parent_execution_id: &str,
        user_id: &str,
        reference: &str,
        input: Value,
        role: Option<ComponentRole>,
    ) -> SandboxResult<Value> {
        let outcome = self
            .run(
                &CallerContext::new(user_id),
                reference,
                input,
                RunOptions {
                    role,
                    parent_execution_id: Some(parent_execution_id.to_owned()),
                },
            )
            .await?;
        serde_json::to_value(outcome)
            .map_err(|e| SandboxError::execution_failed(format!("outcome encoding failed: {e}")))
    }
}

/// Classify a guest failure into the taxonomy: fuel exhaustion and epoch
/// interruption get stable messages, everything else keeps the trap text.
fn classify_guest_error(error: anyhow::Error) -> SandboxError {
    if let Some(trap) = error.downcast_ref::<wasmtime::Trap>() {
        return match trap {
            wasmtime::Trap::OutOfFuel => {
                SandboxError::execution_failed("fuel exhausted: instruction budget consumed")
            }
            wasmtime::Trap::Interrupt => SandboxError::execution_failed("timeout"),
            other => SandboxError::execution_failed(format!("guest trapped: {other}")),
        };
    }
    SandboxError::execution_failed(format!("guest error: {error}"))
}

/// Assembles an [`Executor`] from its external collaborators.
#[derive(Default)]
pub struct ExecutorBuilder {
    config: Option<SandboxConfig>,
    policy_store: Option<Arc<dyn PolicyStore>>,
    secret_store: Option<Arc<dyn SecretStore>>,
    component_registry: Option<Arc<dyn ComponentRegistry>>,
    tool_router: Option<Arc<dyn ToolRouter>>,
    execution_store: Option<Arc<dyn ExecutionStore>>,
}

impl ExecutorBuilder {
    /// Sandbox configuration; defaults apply when omitted.
    pub fn config(mut self, config: SandboxConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// The external policy store.
    pub fn policy_store(mut self, store: Arc<dyn PolicyStore>) -> Self {
        self.policy_store = Some(store);
        self
    }

    /// The external secret store.
    pub fn secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secret_store = Some(store);
        self
    }

    /// The external component registry.
    pub fn component_registry(mut self, registry: Arc<dyn ComponentRegistry>) -> Self {
        self.component_registry = Some(registry);
        self
    }

    /// The external MCP tool router.
    pub fn tool_router(mut self, router: Arc<dyn ToolRouter>) -> Self {
        self.tool_router = Some(router);
        self
    }

    /// The external execution store.
    pub fn execution_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.execution_store = Some(store);
        self
    }

    /// Build the executor.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Engine` when a collaborator is missing or
    /// the Wasmtime engine cannot be created.
    pub fn build(self) -> SandboxResult<Executor> {
        let config = self.config.unwrap_or_default();
        let policy_store = self
            .policy_store
            .ok_or_else(|| SandboxError::engine("executor requires a policy store"))?;
        let secret_store = self
            .secret_store
            .ok_or_else(|| SandboxError::engine("executor requires a secret store"))?;
        let component_registry = self
            .component_registry
            .ok_or_else(|| SandboxError::engine("executor requires a component registry"))?;
        let tool_router = self
            .tool_router
            .ok_or_else(|| SandboxError::engine("executor requires a tool router"))?;
        let execution_store = self
            .execution_store
            .ok_or_else(|| SandboxError::engine("executor requires an execution store"))?;

        let engine = SandboxEngine::new(&config)?;
        let rate = Arc::new(RateLimiter::new());
        let loader = ComponentLoader::new(component_registry, &config);
        let enforcer = PolicyEnforcer::new(policy_store);
        let installer = CapabilityInstaller::new(Arc::clone(&rate), tool_router, &config);
        let journal = ExecutionJournal::new(execution_store);

        Ok(Executor {
            inner: Arc::new(ExecutorInner {
                config,
                engine,
                loader,
                enforcer,
                rate,
                installer,
                journal,
                secrets: secret_store,
                cancellations: DashMap::new(),
            }),
        })
    }
}
