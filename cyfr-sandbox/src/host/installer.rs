//! Role-driven capability installation.
//!
//! The installer builds, per execution, a table of
//! `namespace -> {name -> host closure}` entries and binds it into the
//! Wasmtime linker. Each closure captures the execution's policy snapshot,
//! identity, masker, and the shared rate limiter - there is no ambient
//! authority and no way for a live execution to see a mutated policy.
//!
//! # Import set by role
//!
//! | Role     | HTTP fetch | HTTP stream | MCP tools | Formula invoke | Secrets |
//! |----------|-----------|-------------|-----------|----------------|---------|
//! | Catalyst | yes       | yes         | yes       | -              | yes     |
//! | Reagent  | -         | -           | -         | -              | -       |
//! | Formula  | -         | -           | yes       | yes            | -       |
//!
//! Every role additionally gets the stdout/stderr-only WASI surface (bound
//! separately by the executor); stdin and native WASI HTTP are never
//! linked.
//!
//! Host closures are `json-string -> json-string` and never return an
//! error to the linker: failures become `{"error": {...}}` envelopes so a
//! guest fault in a host call can never take down the executor.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use wasmtime::component::Linker;
use wasmtime::StoreContextMut;

// Layer 3: Internal module imports
use crate::core::config::SandboxConfig;
use crate::core::error::{SandboxError, SandboxResult};
use crate::core::policy::Policy;
use crate::core::reference::{ComponentReference, ComponentRole};
use crate::core::stores::ToolRouter;
use crate::host::formula::{FormulaInvoker, SubInvoker};
use crate::host::http::HttpHandler;
use crate::host::mcp::McpDispatcher;
use crate::host::secrets::SecretsBridge;
use crate::host::stream::StreamRegistry;
use crate::runtime::limiter::HostState;
use crate::security::masking::SecretMasker;
use crate::security::rate_limit::RateLimiter;

/// Namespace of the unary HTTP host function.
pub const NS_HTTP_FETCH: &str = "cyfr:http/fetch@0.1.0";
/// Namespace of the streaming HTTP host functions.
pub const NS_HTTP_STREAMING: &str = "cyfr:http/streaming@0.1.0";
/// Namespace of the MCP tool host function.
pub const NS_MCP_TOOLS: &str = "cyfr:mcp/tools@0.1.0";
/// Namespace of the secret read host function (catalysts only).
pub const NS_SECRETS_READ: &str = "cyfr:secrets/read@0.1.0";
/// Namespace of the recursive invocation host function (formulas only).
pub const NS_FORMULA_INVOKE: &str = "cyfr:formula/invoke@0.1.0";

/// Boxed future returned by a host closure.
pub type HostFuture = Pin<Box<dyn Future<Output = String> + Send + 'static>>;

/// One host function: JSON string in, JSON string out, infallible.
pub type HostFn = Arc<dyn Fn(String) -> HostFuture + Send + Sync>;

/// One namespaced group of host functions.
pub struct HostImport {
    /// `namespace@version` key visible to guest code.
    pub namespace: &'static str,
    /// Function name to closure.
    pub functions: Vec<(&'static str, HostFn)>,
}

/// The full import surface for one execution.
#[derive(Default)]
pub struct ImportTable {
    /// Namespaced imports in installation order.
    pub imports: Vec<HostImport>,
}

impl ImportTable {
    /// Namespaces present in the table, for tests and diagnostics.
    pub fn namespaces(&self) -> Vec<&'static str> {
        self.imports.iter().map(|import| import.namespace).collect()
    }

    /// Function names under one namespace.
    pub fn functions_in(&self, namespace: &str) -> Vec<&'static str> {
        self.imports
            .iter()
            .filter(|import| import.namespace == namespace)
            .flat_map(|import| import.functions.iter().map(|(name, _)| *name))
            .collect()
    }
}

impl std::fmt::Debug for ImportTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportTable")
            .field("namespaces", &self.namespaces())
            .finish()
    }
}

/// Per-execution inputs the installer closes over.
pub struct InstallContext {
    /// Journal id of the execution.
    pub execution_id: String,
    /// Owner of the invocation.
    pub user_id: String,
    /// Canonical reference of the executing component.
    pub reference: ComponentReference,
    /// Policy snapshot, passed by value into every closure.
    pub policy: Policy,
    /// Role the component executes under.
    pub role: ComponentRole,
    /// Resolved secret snapshot (empty for non-catalysts).
    pub secrets: Arc<HashMap<String, String>>,
    /// Masker built from the secret snapshot.
    pub masker: Arc<SecretMasker>,
    /// Callback into the executor for formula sub-invocations.
    pub sub_invoker: Arc<dyn SubInvoker>,
}

/// Everything the executor needs to run and later tear down the
/// capability surface of one execution.
pub struct InstalledCapabilities {
    /// The import table to bind into the linker.
    pub table: ImportTable,
    /// Stream registry to release at teardown.
    pub streams: Arc<StreamRegistry>,
}

/// Builds per-execution import tables.
///
/// Process-wide and cheap to clone; per-execution state arrives through
/// [`InstallContext`].
#[derive(Clone)]
pub struct CapabilityInstaller {
    rate: Arc<RateLimiter>,
    router: Arc<dyn ToolRouter>,
    max_streams: usize,
    allow_reserved_addresses: bool,
}

impl CapabilityInstaller {
    /// Create an installer over the shared rate limiter and tool router.
    pub fn new(
        rate: Arc<RateLimiter>,
        router: Arc<dyn ToolRouter>,
        config: &SandboxConfig,
    ) -> Self {
        Self {
            rate,
            router,
            max_streams: config.max_streams_per_execution,
            allow_reserved_addresses: config.allow_reserved_addresses,
        }
    }

    /// Build the import table for one execution according to its role.
    pub fn install(&self, ctx: InstallContext) -> InstalledCapabilities {
        let streams = Arc::new(StreamRegistry::new(
            self.max_streams,
            Arc::clone(&ctx.masker),
        ));
        let mut table = ImportTable::default();

        match ctx.role {
            ComponentRole::Catalyst => {
                self.install_http(&ctx, &streams, &mut table);
                self.install_mcp(&ctx, &mut table);
                Self::install_secrets(&ctx, &mut table);
            }
            ComponentRole::Reagent => {
                // Pure computation: no imports beyond the WASI
                // stdout/stderr surface bound by the executor.
            }
            ComponentRole::Formula => {
                self.install_mcp(&ctx, &mut table);
                Self::install_formula(&ctx, &mut table);
            }
        }

        InstalledCapabilities { table, streams }
    }

    fn install_http(
        &self,
        ctx: &InstallContext,
        streams: &Arc<StreamRegistry>,
        table: &mut ImportTable,
    ) {
        let handler = Arc::new(HttpHandler::new(
            ctx.policy.clone(),
            ctx.execution_id.clone(),
            ctx.user_id.clone(),
            ctx.reference.clone(),
            Arc::clone(&ctx.masker),
            Arc::clone(&self.rate),
            self.allow_reserved_addresses,
        ));

        let fetch = Arc::clone(&handler);
        table.imports.push(HostImport {
            namespace: NS_HTTP_FETCH,
            functions: vec![(
                "request",
                host_fn(move |request| {
                    let handler = Arc::clone(&fetch);
                    async move { handler.handle(request).await }
                }),
            )],
        });

        let open_handler = Arc::clone(&handler);
        let open_streams = Arc::clone(streams);
        let read_streams = Arc::clone(streams);
        let close_streams = Arc::clone(streams);
        table.imports.push(HostImport {
            namespace: NS_HTTP_STREAMING,
            functions: vec![
                (
                    "request",
                    host_fn(move |request| {
                        let handler = Arc::clone(&open_handler);
                        let streams = Arc::clone(&open_streams);
                        async move { handler.handle_stream_open(&streams, request).await }
                    }),
                ),
                (
                    "read",
                    host_fn(move |request| {
                        let streams = Arc::clone(&read_streams);
                        async move {
                            match parse_handle(&request) {
                                Ok(handle) => match streams.read(handle).await {
                                    Ok(chunk) => chunk.to_string(),
                                    Err(err) => err.to_envelope_string(),
                                },
                                Err(err) => err.to_envelope_string(),
                            }
                        }
                    }),
                ),
                (
                    "close",
                    host_fn(move |request| {
                        let streams = Arc::clone(&close_streams);
                        async move {
                            match parse_handle(&request) {
                                Ok(handle) => streams.close(handle).await.to_string(),
                                Err(err) => err.to_envelope_string(),
                            }
                        }
                    }),
                ),
            ],
        });
    }

    fn install_mcp(&self, ctx: &InstallContext, table: &mut ImportTable) {
        let dispatcher = Arc::new(McpDispatcher::new(
            ctx.policy.clone(),
            ctx.execution_id.clone(),
            ctx.reference.clone(),
            Arc::clone(&self.router),
            Arc::clone(&ctx.masker),
        ));
        table.imports.push(HostImport {
            namespace: NS_MCP_TOOLS,
            functions: vec![(
                "call",
                host_fn(move |request| {
                    let dispatcher = Arc::clone(&dispatcher);
                    async move { dispatcher.dispatch(request).await }
                }),
            )],
        });
    }

    fn install_secrets(ctx: &InstallContext, table: &mut ImportTable) {
        let bridge = Arc::new(SecretsBridge::new(
            Arc::clone(&ctx.secrets),
            &ctx.reference,
        ));
        table.imports.push(HostImport {
            namespace: NS_SECRETS_READ,
            functions: vec![(
                "get",
                host_fn(move |request| {
                    let bridge = Arc::clone(&bridge);
                    async move { bridge.get(&request) }
                }),
            )],
        });
    }

    fn install_formula(ctx: &InstallContext, table: &mut ImportTable) {
        let invoker = Arc::new(FormulaInvoker::new(
            Arc::clone(&ctx.sub_invoker),
            ctx.execution_id.clone(),
            ctx.user_id.clone(),
            Arc::clone(&ctx.masker),
        ));
        table.imports.push(HostImport {
            namespace: NS_FORMULA_INVOKE,
            functions: vec![(
                "call",
                host_fn(move |request| {
                    let invoker = Arc::clone(&invoker);
                    async move { invoker.call(request).await }
                }),
            )],
        });
    }
}

impl std::fmt::Debug for CapabilityInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityInstaller")
            .field("max_streams", &self.max_streams)
            .finish_non_exhaustive()
    }
}

/// Bind an import table into a component linker.
///
/// # Errors
///
/// Returns `SandboxError::Engine` when a namespace or function cannot be
/// registered (duplicate definitions would be a host bug).
pub fn bind_imports(
    linker: &mut Linker<HostState>,
    table: &ImportTable,
) -> SandboxResult<()> {
    for import in &table.imports {
        let mut instance = linker.instance(import.namespace).map_err(|e| {
            SandboxError::engine(format!(
                "failed to register namespace '{}': {e}",
                import.namespace
            ))
        })?;
        for (name, func) in &import.functions {
            let func = Arc::clone(func);
            instance
                .func_wrap_async(
                    name,
                    move |_store: StoreContextMut<'_, HostState>, (request,): (String,)| {
                        let func = Arc::clone(&func);
                        Box::new(async move { Ok(((*func)(request).await,)) })
                    },
                )
                .map_err(|e| {
                    SandboxError::engine(format!(
                        "failed to register '{}#{name}': {e}",
                        import.namespace
                    ))
                })?;
        }
    }
    Ok(())
}

/// Wrap an async closure as a [`HostFn`].
fn host_fn<F, Fut>(f: F) -> HostFn
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = String> + Send + 'static,
{
    Arc::new(move |request| -> HostFuture { Box::pin(f(request)) })
}

/// Parse a stream handle from a raw number or `{"handle": n}` JSON.
fn parse_handle(request: &str) -> SandboxResult<u64> {
    let trimmed = request.trim();
    if let Ok(handle) = trimmed.parse::<u64>() {
        return Ok(handle);
    }
    let value: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| SandboxError::invalid_json(e.to_string()))?;
    value
        .get("handle")
        .and_then(serde_json::Value::as_u64)
        .or_else(|| value.as_u64())
        .ok_or_else(|| SandboxError::invalid_request("expected a stream handle"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct NullRouter;

    #[async_trait]
    impl ToolRouter for NullRouter {
        async fn route(&self, tool: &str, action: &str, _args: &Value) -> SandboxResult<Value> {
            Err(SandboxError::dispatch_error(
                format!("{tool}.{action}"),
                "no services wired",
            ))
        }
    }

    struct NullInvoker;

    #[async_trait]
    impl SubInvoker for NullInvoker {
        async fn invoke_child(
            &self,
            _parent_execution_id: &str,
            _user_id: &str,
            _reference: &str,
            _input: Value,
            _role: Option<ComponentRole>,
        ) -> SandboxResult<Value> {
            Ok(json!({"status": "completed"}))
        }
    }

    fn installer() -> CapabilityInstaller {
        CapabilityInstaller::new(
            Arc::new(RateLimiter::new()),
            Arc::new(NullRouter),
            &SandboxConfig::default(),
        )
    }

    fn context(role: ComponentRole) -> InstallContext {
        let reference = match role {
            ComponentRole::Catalyst => "catalyst:weather.fetcher:1.0.0",
            ComponentRole::Reagent => "reagent:math.sum:1.0.0",
            ComponentRole::Formula => "formula:pipeline.report:1.0.0",
        };
        InstallContext {
            execution_id: "exec_test".to_owned(),
            user_id: "user-1".to_owned(),
            reference: ComponentReference::parse(reference).unwrap(),
            policy: Policy::default(),
            role,
            secrets: Arc::new(HashMap::new()),
            masker: Arc::new(SecretMasker::default()),
            sub_invoker: Arc::new(NullInvoker),
        }
    }

    #[test]
    fn test_catalyst_import_surface() {
        let installed = installer().install(context(ComponentRole::Catalyst));
        let namespaces = installed.table.namespaces();
        assert_eq!(
            namespaces,
            vec![NS_HTTP_FETCH, NS_HTTP_STREAMING, NS_MCP_TOOLS, NS_SECRETS_READ]
        );
        assert_eq!(
            installed.table.functions_in(NS_HTTP_STREAMING),
            vec!["request", "read", "close"]
        );
        assert!(!namespaces.contains(&NS_FORMULA_INVOKE));
    }

    #[test]
    fn test_reagent_has_no_imports() {
        let installed = installer().install(context(ComponentRole::Reagent));
        assert!(installed.table.imports.is_empty());
    }

    #[test]
    fn test_formula_import_surface() {
        let installed = installer().install(context(ComponentRole::Formula));
        let namespaces = installed.table.namespaces();
        assert_eq!(namespaces, vec![NS_MCP_TOOLS, NS_FORMULA_INVOKE]);
        assert!(!namespaces.contains(&NS_HTTP_FETCH));
        assert!(!namespaces.contains(&NS_SECRETS_READ));
    }

    #[test]
    fn test_parse_handle_accepts_both_wire_forms() {
        assert_eq!(parse_handle("7").unwrap(), 7);
        assert_eq!(parse_handle(" 7 ").unwrap(), 7);
        assert_eq!(parse_handle(r#"{"handle": 12}"#).unwrap(), 12);
        assert_eq!(parse_handle("12").unwrap(), 12);
        assert!(parse_handle(r#"{"other": 1}"#).is_err());
        assert!(parse_handle("not a handle").is_err());
    }

    #[tokio::test]
    async fn test_host_closures_return_envelopes_not_errors() {
        let installed = installer().install(context(ComponentRole::Catalyst));
        let import = installed
            .table
            .imports
            .iter()
            .find(|i| i.namespace == NS_HTTP_FETCH)
            .unwrap();
        let (_, func) = &import.functions[0];
        let out = (**func)("{broken".to_owned()).await;
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error"]["type"], "invalid_json");
    }
}
