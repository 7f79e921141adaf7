//! Policy loading, validation, and per-request checks.
//!
//! The [`PolicyEnforcer`] sits between the policy store and every gate in
//! the sandbox: the executor's pre-flight validation and the host
//! functions' per-call domain, method, tool, and storage-path checks.
//!
//! # Matching rules
//!
//! - **Domains**: an entry is either a literal (exact, case-insensitive
//!   host match) or `*.suffix` (hosts ending with `.suffix`). `*` alone
//!   matches all. No regex.
//! - **Methods**: case-insensitive equality against the allowed set.
//! - **Tools**: `service.action` (exact) or `service.*` (prefix on the
//!   dotted name); an empty set denies all.
//! - **Storage paths**: prefix match; an empty list is unrestricted.
//!
//! Every denial names both the rejected value and the allowed set so the
//! component-visible error is diagnosable.

// Layer 1: Standard library imports
use std::sync::Arc;

// Layer 2: Third-party crate imports
// (none - matching is pure string work)

// Layer 3: Internal module imports
use crate::core::error::{SandboxError, SandboxResult};
use crate::core::policy::Policy;
use crate::core::reference::{ComponentReference, ComponentRole};
use crate::core::stores::PolicyStore;

/// Everything the executor needs to run one invocation, derived from the
/// effective policy.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Snapshot of the effective policy.
    pub policy: Policy,
    /// Whether a stored policy row was found (`false` means defaults).
    pub policy_applied: bool,
    /// Wall-clock ceiling in milliseconds.
    pub timeout_ms: u64,
    /// Linear memory ceiling in bytes.
    pub max_memory_bytes: u64,
    /// Role the component will execute under.
    pub role: ComponentRole,
}

/// Loads policies and gates every capability invocation.
///
/// Cheap to clone; the store handle is shared.
#[derive(Clone)]
pub struct PolicyEnforcer {
    store: Arc<dyn PolicyStore>,
}

impl PolicyEnforcer {
    /// Create an enforcer over a policy store.
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    /// Effective policy for a component: the stored row, or defaults when
    /// none exists. The boolean reports which case occurred.
    pub async fn get_effective(
        &self,
        reference: &ComponentReference,
    ) -> SandboxResult<(Policy, bool)> {
        match self.store.policy_for(reference).await? {
            Some(policy) => Ok((policy, true)),
            None => Ok((Policy::default(), false)),
        }
    }

    /// Pre-flight gate: validate that `reference` may execute under `role`.
    ///
    /// Catalysts must have a stored policy with a non-empty
    /// `allowed_domains`; reagents and formulas always pass. Runs before
    /// any execution record is written.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::PolicyNotConfigured` for a catalyst without a
    /// usable policy.
    pub async fn validate_execution(
        &self,
        reference: &ComponentReference,
        role: ComponentRole,
    ) -> SandboxResult<(Policy, bool)> {
        let (policy, applied) = self.get_effective(reference).await?;
        Self::check_role_gate(reference, role, &policy, applied)?;
        Ok((policy, applied))
    }

    /// The role gate over an already-fetched policy, for callers that
    /// interleave other pre-flight checks between fetch and gate.
    pub fn check_role_gate(
        reference: &ComponentReference,
        role: ComponentRole,
        policy: &Policy,
        policy_applied: bool,
    ) -> SandboxResult<()> {
        if role == ComponentRole::Catalyst {
            if !policy_applied {
                return Err(SandboxError::policy_not_configured(
                    reference.to_string(),
                    "catalysts require a policy with allowed_domains",
                ));
            }
            if policy.allowed_domains.is_empty() {
                return Err(SandboxError::policy_not_configured(
                    reference.to_string(),
                    "allowed_domains is empty; catalysts need at least one entry",
                ));
            }
        }
        Ok(())
    }

    /// Assemble execution options from the validated policy.
    pub async fn build_execution_opts(
        &self,
        reference: &ComponentReference,
        role: ComponentRole,
    ) -> SandboxResult<ExecutionOptions> {
        let (policy, policy_applied) = self.validate_execution(reference, role).await?;
        Ok(ExecutionOptions {
            timeout_ms: policy.timeout_ms,
            max_memory_bytes: policy.max_memory_bytes,
            policy,
            policy_applied,
            role,
        })
    }

    /// Check an HTTP host against `allowed_domains`.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::DomainBlocked` naming the host and the
    /// allowed set.
    pub fn check_domain(policy: &Policy, host: &str) -> SandboxResult<()> {
        if policy
            .allowed_domains
            .iter()
            .any(|entry| domain_matches(entry, host))
        {
            Ok(())
        } else {
            Err(SandboxError::domain_blocked(host, &policy.allowed_domains))
        }
    }

    /// Check an HTTP method against `allowed_methods` (case-insensitive).
    pub fn check_method(policy: &Policy, method: &str) -> SandboxResult<()> {
        if policy
            .allowed_methods
            .iter()
            .any(|entry| entry.eq_ignore_ascii_case(method))
        {
            Ok(())
        } else {
            Err(SandboxError::method_blocked(
                method,
                &policy.allowed_methods,
            ))
        }
    }

    /// Combined method + domain check for one HTTP request.
    pub fn check_http_request(policy: &Policy, host: &str, method: &str) -> SandboxResult<()> {
        Self::check_method(policy, method)?;
        Self::check_domain(policy, host)
    }

    /// Check a dotted `service.action` name against `allowed_tools`.
    ///
    /// An empty allowed set denies every call.
    pub fn check_tool(policy: &Policy, tool_action: &str) -> SandboxResult<()> {
        if policy
            .allowed_tools
            .iter()
            .any(|entry| tool_matches(entry, tool_action))
        {
            Ok(())
        } else {
            Err(SandboxError::tool_denied(
                tool_action,
                &policy.allowed_tools,
            ))
        }
    }

    /// Check a storage path against `allowed_storage_paths` (prefix match).
    ///
    /// An empty list means unrestricted.
    pub fn check_storage_path(policy: &Policy, path: &str) -> SandboxResult<()> {
        if policy.allowed_storage_paths.is_empty()
            || policy
                .allowed_storage_paths
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
        {
            Ok(())
        } else {
            Err(SandboxError::storage_path_denied(
                path,
                &policy.allowed_storage_paths,
            ))
        }
    }
}

impl std::fmt::Debug for PolicyEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEnforcer").finish_non_exhaustive()
    }
}

/// Match a host against one `allowed_domains` entry.
///
/// `*` matches everything; `*.suffix` matches hosts ending with `.suffix`;
/// anything else is an exact case-insensitive comparison.
fn domain_matches(entry: &str, host: &str) -> bool {
    if entry == "*" {
        return true;
    }
    let host = host.to_ascii_lowercase();
    if let Some(suffix) = entry.strip_prefix("*.") {
        let suffix = suffix.to_ascii_lowercase();
        return host.ends_with(&format!(".{suffix}")) && host.len() > suffix.len() + 1;
    }
    host == entry.to_ascii_lowercase()
}

/// Match a dotted tool name against one `allowed_tools` entry.
///
/// `service.*` matches any action of that service; anything else is exact.
fn tool_matches(entry: &str, tool_action: &str) -> bool {
    if let Some(service) = entry.strip_suffix(".*") {
        return tool_action
            .strip_prefix(service)
            .is_some_and(|rest| rest.starts_with('.') && rest.len() > 1);
    }
    entry == tool_action
}
