//! Per-execution registry of streaming HTTP responses.
//!
//! The streaming HTTP host functions (`request`, `read`, `close`) hand the
//! guest opaque `u64` handles. Handles live in a per-execution
//! [`StreamRegistry`], are capped in number, and are all released when the
//! execution tears down - cleanup is a single registry drop, not a sweep
//! of global state.
//!
//! Chunks cross the guest boundary base64-encoded so binary bodies
//! round-trip; UTF-8 chunks are secret-masked before encoding.
//!
//! Semantics at the edges:
//!
//! - `close` is idempotent; closing an unknown handle succeeds
//! - `read` after an individual `close` reports `invalid_handle`
//! - `read` after execution teardown reports `cancelled`

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::Mutex;

// Layer 3: Internal module imports
use crate::core::error::{SandboxError, SandboxResult};
use crate::security::masking::SecretMasker;

struct StreamEntry {
    response: reqwest::Response,
    /// Response-size budget remaining for this stream.
    remaining: usize,
}

struct StreamTable {
    next_handle: u64,
    live: HashMap<u64, StreamEntry>,
    torn_down: bool,
}

/// Registry of live streaming responses for one execution.
///
/// The guest instance is single-threaded, so calls arrive sequentially;
/// the async mutex only guards against the teardown path racing a read.
pub struct StreamRegistry {
    table: Mutex<StreamTable>,
    limit: usize,
    masker: Arc<SecretMasker>,
}

impl StreamRegistry {
    /// Create a registry capped at `limit` concurrent streams.
    pub fn new(limit: usize, masker: Arc<SecretMasker>) -> Self {
        Self {
            table: Mutex::new(StreamTable {
                next_handle: 1,
                live: HashMap::new(),
                torn_down: false,
            }),
            limit,
            masker,
        }
    }

    /// Register an upstream response and return its handle.
    ///
    /// # Errors
    ///
    /// - `SandboxError::StreamLimit` when the execution already holds the
    ///   maximum number of live streams
    /// - `SandboxError::Cancelled` when the execution is tearing down
    pub async fn open(
        &self,
        response: reqwest::Response,
        response_budget: usize,
    ) -> SandboxResult<u64> {
        let mut table = self.table.lock().await;
        if table.torn_down {
            return Err(SandboxError::Cancelled);
        }
        if table.live.len() >= self.limit {
            return Err(SandboxError::StreamLimit { limit: self.limit });
        }
        let handle = table.next_handle;
        table.next_handle += 1;
        table.live.insert(
            handle,
            StreamEntry {
                response,
                remaining: response_budget,
            },
        );
        Ok(handle)
    }

    /// Read the next chunk from a stream.
    ///
    /// Returns `{"chunk": <base64>, "eof": false}` while data remains and
    /// `{"eof": true}` at end of stream (the handle is released then).
    ///
    /// # Errors
    ///
    /// - `SandboxError::InvalidHandle` for unknown or closed handles
    /// - `SandboxError::Cancelled` after execution teardown
    /// - `SandboxError::ResponseTooLarge` when the stream exceeds its budget
    pub async fn read(&self, handle: u64) -> SandboxResult<Value> {
        let mut table = self.table.lock().await;
        if table.torn_down {
            return Err(SandboxError::Cancelled);
        }
        let Some(entry) = table.live.get_mut(&handle) else {
            return Err(SandboxError::InvalidHandle { handle });
        };

        match entry.response.chunk().await {
            Ok(Some(bytes)) => {
                if bytes.len() > entry.remaining {
                    let limit = entry.remaining;
                    table.live.remove(&handle);
                    return Err(SandboxError::ResponseTooLarge { limit });
                }
                entry.remaining -= bytes.len();
                Ok(json!({
                    "chunk": STANDARD.encode(self.mask_chunk(&bytes)),
                    "eof": false,
                }))
            }
            Ok(None) => {
                table.live.remove(&handle);
                Ok(json!({"eof": true}))
            }
            Err(e) => {
                table.live.remove(&handle);
                Err(SandboxError::execution_failed(format!(
                    "stream read failed: {e}"
                )))
            }
        }
    }

    /// Release a handle. Idempotent: closing an unknown or already-closed
    /// handle succeeds.
    pub async fn close(&self, handle: u64) -> Value {
        let mut table = self.table.lock().await;
        if table.live.remove(&handle).is_some() {
            tracing::debug!(handle, "stream closed");
        }
        json!({"closed": true})
    }

    /// Release every live handle and mark the registry torn down.
    ///
    /// Called unconditionally from the executor's teardown step; reads
    /// arriving afterwards observe `cancelled`.
    pub async fn close_all(&self) {
        let mut table = self.table.lock().await;
        let dropped = table.live.len();
        table.live.clear();
        table.torn_down = true;
        if dropped > 0 {
            tracing::debug!(dropped, "streams released at teardown");
        }
    }

    /// Number of live handles (monitoring and tests).
    pub async fn live_count(&self) -> usize {
        self.table.lock().await.live.len()
    }

    /// Mask UTF-8 chunks; binary chunks pass through untouched.
    fn mask_chunk(&self, bytes: &[u8]) -> Vec<u8> {
        if self.masker.is_empty() {
            return bytes.to_vec();
        }
        match std::str::from_utf8(bytes) {
            Ok(text) => self.masker.mask_str(text).into_bytes(),
            Err(_) => bytes.to_vec(),
        }
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    fn registry(limit: usize) -> StreamRegistry {
        StreamRegistry::new(limit, Arc::new(SecretMasker::default()))
    }

    #[tokio::test]
    async fn test_read_unknown_handle_is_invalid() {
        let registry = registry(3);
        let err = registry.read(42).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_handle");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let registry = registry(3);
        let first = registry.close(7).await;
        let second = registry.close(7).await;
        assert_eq!(first, json!({"closed": true}));
        assert_eq!(second, json!({"closed": true}));
    }

    #[tokio::test]
    async fn test_read_after_teardown_is_cancelled() {
        let registry = registry(3);
        registry.close_all().await;
        let err = registry.read(1).await.unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    #[tokio::test]
    async fn test_teardown_clears_live_handles() {
        let registry = registry(3);
        registry.close_all().await;
        assert_eq!(registry.live_count().await, 0);
    }

    #[test]
    fn test_binary_chunks_pass_through_masking() {
        let registry = StreamRegistry::new(3, Arc::new(SecretMasker::new(["topsecret"])));
        let binary = vec![0u8, 159, 146, 150];
        assert_eq!(registry.mask_chunk(&binary), binary);
    }

    #[test]
    fn test_utf8_chunks_are_masked() {
        let registry = StreamRegistry::new(3, Arc::new(SecretMasker::new(["topsecret"])));
        let masked = registry.mask_chunk(b"key=topsecret");
        assert_eq!(masked, b"key=[REDACTED]".to_vec());
    }
}
