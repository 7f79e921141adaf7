//! Caller identity attached to every invocation.

// Layer 1: Standard library imports
use std::fmt;

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};

/// Identity of the authenticated user on whose behalf an execution runs.
///
/// Every journal read is scoped by this identity; a user can never observe
/// another user's records through the journal interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerContext {
    /// Authenticated user id.
    pub user_id: String,
}

impl CallerContext {
    /// Create a caller context for a user id.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for CallerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.user_id)
    }
}
