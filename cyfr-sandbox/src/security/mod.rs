//! Policy evaluation and egress security.
//!
//! Everything on the deny path lives here:
//!
//! - [`enforcer`] - policy loading, pre-flight gates, domain/method/tool/path checks
//! - [`rate_limit`] - fixed-window quotas per `(user, component)`
//! - [`masking`] - secret redaction on every egress path
//! - [`netguard`] - DNS resolution and the private/reserved address filter

// Submodules (module declarations only)
pub mod enforcer;
pub mod masking;
pub mod netguard;
pub mod rate_limit;

// Re-export the most commonly used types at the module root
pub use enforcer::{ExecutionOptions, PolicyEnforcer};
pub use masking::SecretMasker;
pub use rate_limit::{RateDecision, RateLimiter};
