//! Wasmtime engine configuration and lifecycle.
//!
//! One [`SandboxEngine`] serves the whole process; executions share the
//! compiled-code cache and the epoch ticker but get their own `Store`.
//!
//! # Configuration
//!
//! - **Component Model**: components are the only supported binary format
//! - **Async**: host functions suspend on I/O without blocking the runtime
//! - **Fuel**: unit-of-work metering bounds guest CPU
//! - **Epoch interruption**: a background ticker increments the engine
//!   epoch so wall-clock deadlines pre-emptively unwind guest code that
//!   never calls back into the host
//!
//! # Design Pattern
//!
//! `Arc<Inner>` for cheap cloning across execution tasks. The epoch ticker
//! thread holds a `Weak` reference and exits when the last engine handle
//! drops.

// Layer 1: Standard library imports
use std::sync::{Arc, Weak};
use std::time::Duration;

// Layer 2: Third-party crate imports
use wasmtime::component::Component;
use wasmtime::{Config, Engine};

// Layer 3: Internal module imports
use crate::core::config::SandboxConfig;
use crate::core::error::{SandboxError, SandboxResult};

/// Process-wide WebAssembly engine.
#[derive(Clone)]
pub struct SandboxEngine {
    inner: Arc<SandboxEngineInner>,
}

struct SandboxEngineInner {
    engine: Engine,
    epoch_tick: Duration,
}

impl SandboxEngine {
    /// Create an engine from sandbox configuration and start the epoch
    /// ticker.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Engine` when Wasmtime rejects the
    /// configuration or the ticker thread cannot be spawned.
    pub fn new(config: &SandboxConfig) -> SandboxResult<Self> {
        let mut wasmtime_config = Config::new();
        wasmtime_config.wasm_component_model(true);
        wasmtime_config.async_support(true);
        wasmtime_config.consume_fuel(true);
        wasmtime_config.epoch_interruption(true);

        let engine = Engine::new(&wasmtime_config)
            .map_err(|e| SandboxError::engine(format!("failed to create engine: {e}")))?;

        let epoch_tick = Duration::from_millis(config.epoch_tick_ms.max(1));
        let inner = Arc::new(SandboxEngineInner { engine, epoch_tick });

        spawn_epoch_ticker(Arc::downgrade(&inner), epoch_tick)?;

        Ok(Self { inner })
    }

    /// The underlying Wasmtime engine, for store and linker construction.
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Compile component bytes.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::ExecutionFailed` when the bytes are not a
    /// valid WebAssembly component.
    pub fn load_component(&self, bytes: &[u8]) -> SandboxResult<Component> {
        Component::new(&self.inner.engine, bytes).map_err(|e| {
            SandboxError::execution_failed(format!("failed to parse component: {e}"))
        })
    }

    /// Epoch ticks corresponding to a wall-clock ceiling, rounded up so a
    /// deadline never fires early.
    pub fn ticks_for_timeout(&self, timeout: Duration) -> u64 {
        let tick_ms = self.inner.epoch_tick.as_millis().max(1) as u64;
        let timeout_ms = timeout.as_millis() as u64;
        timeout_ms / tick_ms + 1
    }
}

impl std::fmt::Debug for SandboxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEngine")
            .field("epoch_tick", &self.inner.epoch_tick)
            .finish()
    }
}

/// Start the background thread that advances the engine epoch.
///
/// The thread holds only a weak handle; it observes the drop of the last
/// engine clone and exits on the next tick.
fn spawn_epoch_ticker(
    inner: Weak<SandboxEngineInner>,
    tick: Duration,
) -> SandboxResult<()> {
    std::thread::Builder::new()
        .name("cyfr-epoch-ticker".to_owned())
        .spawn(move || loop {
            match inner.upgrade() {
                Some(engine) => engine.engine.increment_epoch(),
                None => break,
            }
            std::thread::sleep(tick);
        })
        .map_err(|e| SandboxError::engine(format!("failed to spawn epoch ticker: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;

    #[test]
    fn test_engine_creation() {
        let engine = SandboxEngine::new(&SandboxConfig::default());
        assert!(engine.is_ok());
    }

    #[test]
    fn test_engine_clone_shares_inner() {
        let engine = SandboxEngine::new(&SandboxConfig::default()).unwrap();
        let cloned = engine.clone();
        assert!(Arc::ptr_eq(&engine.inner, &cloned.inner));
    }

    #[test]
    fn test_ticks_round_up() {
        let engine = SandboxEngine::new(&SandboxConfig::default()).unwrap();
        // 10ms tick: a 30s timeout is 3000 ticks, plus one for rounding
        assert_eq!(engine.ticks_for_timeout(Duration::from_secs(30)), 3001);
        // Sub-tick timeouts still get one full tick
        assert_eq!(engine.ticks_for_timeout(Duration::from_millis(3)), 1);
    }

    #[test]
    fn test_invalid_bytes_are_rejected() {
        let engine = SandboxEngine::new(&SandboxConfig::default()).unwrap();
        let err = engine.load_component(b"not a component").err().unwrap();
        assert_eq!(err.kind(), "execution_failed");
    }

    #[test]
    fn test_engine_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<SandboxEngine>();
        assert_sync::<SandboxEngine>();
    }
}
