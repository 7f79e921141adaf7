//! Crash-resilient execution lifecycle records.
//!
//! The journal writes one `started` row strictly before any capability is
//! installed and exactly one terminal row afterwards. Each call is a
//! single durable write to the external execution store; terminal writes
//! refuse to transition a record that is not currently `Running`, so a
//! cancel racing a completion produces one winner and one
//! `InvalidTransition`.
//!
//! # Crash recovery
//!
//! On startup the journal touches nothing: a record still `Running` after
//! a restart is surfaced as `Running` by the list APIs, and operators
//! decide whether to mark it failed. Auto-rewriting statuses would destroy
//! the crash evidence.
//!
//! # Ownership
//!
//! `get` and `list` always scope by `user_id`; a user cannot observe
//! another user's records through this interface.

// Layer 1: Standard library imports
use std::sync::Arc;

// Layer 2: Third-party crate imports
use chrono::Utc;
use serde_json::Value;

// Layer 3: Internal module imports
use crate::core::error::{SandboxError, SandboxResult};
use crate::core::record::{ExecutionRecord, ExecutionStatus};
use crate::core::stores::{ExecutionStore, RecordFilter};

// Submodules
pub mod memory;

/// Lifecycle writer over the external execution store.
#[derive(Clone)]
pub struct ExecutionJournal {
    store: Arc<dyn ExecutionStore>,
}

impl ExecutionJournal {
    /// Create a journal over an execution store.
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Insert the `started` row. Must happen before capability
    /// installation; the record arrives already in `Running`.
    pub async fn write_started(&self, record: &ExecutionRecord) -> SandboxResult<()> {
        debug_assert_eq!(record.status, ExecutionStatus::Running);
        self.store.insert(record).await
    }

    /// Terminal write: `Completed` with masked output.
    pub async fn write_completed(
        &self,
        id: &str,
        output: Value,
        logs: Option<String>,
    ) -> SandboxResult<ExecutionRecord> {
        self.finish(id, logs, |record| {
            record.status = ExecutionStatus::Completed;
            record.output = Some(output);
        })
        .await
    }

    /// Terminal write: `Failed` with a classified, masked error message.
    pub async fn write_failed(
        &self,
        id: &str,
        error_message: String,
        logs: Option<String>,
    ) -> SandboxResult<ExecutionRecord> {
        self.finish(id, logs, |record| {
            record.status = ExecutionStatus::Failed;
            record.error_message = Some(error_message);
        })
        .await
    }

    /// Terminal write: `Cancelled`.
    pub async fn write_cancelled(
        &self,
        id: &str,
        logs: Option<String>,
    ) -> SandboxResult<ExecutionRecord> {
        self.finish(id, logs, |record| {
            record.status = ExecutionStatus::Cancelled;
            record.error_message = Some("Execution cancelled".to_owned());
        })
        .await
    }

    /// Fetch one record, scoped to its owner.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::NotFound` both for missing records and for
    /// records owned by another user - indistinguishable by design.
    pub async fn get(&self, user_id: &str, id: &str) -> SandboxResult<ExecutionRecord> {
        match self.store.fetch(id).await? {
            Some(record) if record.user_id == user_id => Ok(record),
            _ => Err(SandboxError::not_found(id)),
        }
    }

    /// List records for one user, newest first.
    pub async fn list(&self, filter: &RecordFilter) -> SandboxResult<Vec<ExecutionRecord>> {
        self.store.list(filter).await
    }

    /// Shared terminal-write path: load, check `Running`, stamp, update.
    async fn finish(
        &self,
        id: &str,
        logs: Option<String>,
        apply: impl FnOnce(&mut ExecutionRecord),
    ) -> SandboxResult<ExecutionRecord> {
        let mut record = self
            .store
            .fetch(id)
            .await?
            .ok_or_else(|| SandboxError::not_found(id))?;

        if record.status != ExecutionStatus::Running {
            return Err(SandboxError::InvalidTransition {
                id: id.to_owned(),
                from: record.status.to_string(),
            });
        }

        apply(&mut record);
        let completed_at = Utc::now();
        record.completed_at = Some(completed_at);
        record.duration_ms = Some(
            (completed_at - record.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        if logs.is_some() {
            record.logs = logs;
        }

        self.store.update(&record).await?;
        Ok(record)
    }
}

impl std::fmt::Debug for ExecutionJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionJournal").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::memory::MemoryExecutionStore;
    use super::*;
    use crate::core::policy::Policy;
    use crate::core::reference::ComponentReference;
    use serde_json::json;

    fn journal() -> ExecutionJournal {
        ExecutionJournal::new(Arc::new(MemoryExecutionStore::new()))
    }

    fn started_record(user: &str) -> ExecutionRecord {
        ExecutionRecord::started(
            user,
            &ComponentReference::parse("reagent:math.sum:1.0.0").unwrap(),
            "sha256:abcd",
            json!({"a": 1}),
            "sha256:ef01",
            Policy::default(),
            None,
        )
    }

    #[tokio::test]
    async fn test_started_then_completed() {
        let journal = journal();
        let record = started_record("user-1");
        journal.write_started(&record).await.unwrap();

        let done = journal
            .write_completed(&record.id, json!({"result": 8}), None)
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.output, Some(json!({"result": 8})));
        assert!(done.completed_at.is_some());
        assert!(done.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_second_terminal_write_is_invalid_transition() {
        let journal = journal();
        let record = started_record("user-1");
        journal.write_started(&record).await.unwrap();
        journal
            .write_completed(&record.id, json!(null), None)
            .await
            .unwrap();

        let err = journal
            .write_failed(&record.id, "late failure".to_owned(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        assert!(err.to_string().contains("completed"));
    }

    #[tokio::test]
    async fn test_cancelled_write_sets_message() {
        let journal = journal();
        let record = started_record("user-1");
        journal.write_started(&record).await.unwrap();

        let cancelled = journal.write_cancelled(&record.id, None).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert_eq!(
            cancelled.error_message.as_deref(),
            Some("Execution cancelled")
        );
    }

    #[tokio::test]
    async fn test_terminal_write_on_missing_record_is_not_found() {
        let journal = journal();
        let err = journal
            .write_completed("exec_missing", json!(null), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_get_scopes_by_user() {
        let journal = journal();
        let record = started_record("user-1");
        journal.write_started(&record).await.unwrap();

        assert!(journal.get("user-1", &record.id).await.is_ok());
        let err = journal.get("user-2", &record.id).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_list_scopes_by_user_and_status() {
        let journal = journal();
        let mine = started_record("user-1");
        let theirs = started_record("user-2");
        journal.write_started(&mine).await.unwrap();
        journal.write_started(&theirs).await.unwrap();
        journal
            .write_completed(&mine.id, json!(null), None)
            .await
            .unwrap();

        let all_mine = journal
            .list(&RecordFilter::for_user("user-1"))
            .await
            .unwrap();
        assert_eq!(all_mine.len(), 1);
        assert_eq!(all_mine[0].id, mine.id);

        let running = journal
            .list(&RecordFilter {
                user_id: "user-1".to_owned(),
                status: Some(ExecutionStatus::Running),
                limit: None,
            })
            .await
            .unwrap();
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn test_logs_are_attached_at_terminal_write() {
        let journal = journal();
        let record = started_record("user-1");
        journal.write_started(&record).await.unwrap();

        let done = journal
            .write_completed(&record.id, json!(null), Some("guest output".to_owned()))
            .await
            .unwrap();
        assert_eq!(done.logs.as_deref(), Some("guest output"));
    }
}
