//! In-memory execution store for tests and embedded use.
//!
//! The production store is the external SQLite service; this
//! implementation keeps the same contract (duplicate-insert refusal,
//! whole-record updates, newest-first listing) over a concurrent map.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use dashmap::DashMap;

// Layer 3: Internal module imports
use crate::core::error::{SandboxError, SandboxResult};
use crate::core::record::ExecutionRecord;
use crate::core::stores::{ExecutionStore, RecordFilter};

/// Concurrent in-memory record store.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    records: DashMap<String, ExecutionRecord>,
}

impl MemoryExecutionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Number of stored records (tests and monitoring).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn insert(&self, record: &ExecutionRecord) -> SandboxResult<()> {
        match self.records.entry(record.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SandboxError::store(format!(
                "duplicate insert for '{}'",
                record.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn update(&self, record: &ExecutionRecord) -> SandboxResult<()> {
        match self.records.get_mut(&record.id) {
            Some(mut slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(SandboxError::store(format!(
                "update for unknown record '{}'",
                record.id
            ))),
        }
    }

    async fn fetch(&self, id: &str) -> SandboxResult<Option<ExecutionRecord>> {
        Ok(self.records.get(id).map(|slot| slot.clone()))
    }

    async fn list(&self, filter: &RecordFilter) -> SandboxResult<Vec<ExecutionRecord>> {
        let mut matching: Vec<ExecutionRecord> = self
            .records
            .iter()
            .filter(|slot| slot.user_id == filter.user_id)
            .filter(|slot| filter.status.is_none_or(|status| slot.status == status))
            .map(|slot| slot.clone())
            .collect();

        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::core::policy::Policy;
    use crate::core::record::ExecutionStatus;
    use crate::core::reference::ComponentReference;
    use serde_json::json;

    fn record(user: &str) -> ExecutionRecord {
        ExecutionRecord::started(
            user,
            &ComponentReference::parse("reagent:math.sum:1.0.0").unwrap(),
            "sha256:abcd",
            json!({}),
            "sha256:ef01",
            Policy::default(),
            None,
        )
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_refused() {
        let store = MemoryExecutionStore::new();
        let row = record("user-1");
        store.insert(&row).await.unwrap();
        let err = store.insert(&row).await.unwrap_err();
        assert_eq!(err.kind(), "store_error");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_update_requires_existing_record() {
        let store = MemoryExecutionStore::new();
        let err = store.update(&record("user-1")).await.unwrap_err();
        assert_eq!(err.kind(), "store_error");
    }

    #[tokio::test]
    async fn test_fetch_round_trips() {
        let store = MemoryExecutionStore::new();
        let row = record("user-1");
        store.insert(&row).await.unwrap();
        let fetched = store.fetch(&row.id).await.unwrap().unwrap();
        assert_eq!(fetched, row);
        assert!(store.fetch("exec_other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_and_limits() {
        let store = MemoryExecutionStore::new();
        for _ in 0..3 {
            store.insert(&record("user-1")).await.unwrap();
        }
        store.insert(&record("user-2")).await.unwrap();

        let mine = store
            .list(&RecordFilter::for_user("user-1"))
            .await
            .unwrap();
        assert_eq!(mine.len(), 3);

        let limited = store
            .list(&RecordFilter {
                user_id: "user-1".to_owned(),
                status: Some(ExecutionStatus::Running),
                limit: Some(2),
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }
}
