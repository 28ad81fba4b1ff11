//! Wasmtime engine wrapper.

use std::sync::Arc;

use tracing::info;
use wasmtime::{Config, Engine};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

/// The wasmtime engine shared by every bridge instance.
///
/// # Example
///
/// ```
/// use tether_host::{BridgeEngine, EngineConfig};
///
/// let engine = BridgeEngine::new(EngineConfig::default()).unwrap();
/// assert!(!engine.fuel_enabled());
/// ```
pub struct BridgeEngine {
    /// The underlying Wasmtime engine.
    inner: Engine,
    /// Configuration used to create this engine.
    config: EngineConfig,
}

impl BridgeEngine {
    /// Create a new engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is rejected by wasmtime.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        if config.max_wasm_stack == 0 {
            return Err(EngineError::InvalidConfig(
                "max_wasm_stack must be non-zero".to_string(),
            ));
        }

        let mut wasmtime_config = Config::new();
        wasmtime_config.consume_fuel(config.fuel_enabled);
        wasmtime_config.max_wasm_stack(config.max_wasm_stack);
        wasmtime_config.debug_info(config.debug_info);

        // Trampolines live in a funcref table; strings use memory.copy.
        wasmtime_config.wasm_bulk_memory(true);
        wasmtime_config.wasm_multi_value(true);
        wasmtime_config.wasm_reference_types(true);

        let inner = Engine::new(&wasmtime_config)?;

        info!(
            fuel = config.fuel_enabled,
            max_wasm_stack = config.max_wasm_stack,
            "Created bridge engine"
        );

        Ok(Self { inner, config })
    }

    /// Create a new engine with default configuration.
    pub fn default_engine() -> EngineResult<Self> {
        Self::new(EngineConfig::default())
    }

    /// Get a reference to the underlying Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.inner
    }

    /// Get the configuration used to create this engine.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check if fuel-based limiting is enabled.
    pub fn fuel_enabled(&self) -> bool {
        self.config.fuel_enabled
    }
}

impl std::fmt::Debug for BridgeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeEngine")
            .field("config", &self.config)
            .finish()
    }
}

/// A shared reference to a bridge engine.
pub type SharedEngine = Arc<BridgeEngine>;

/// Extension trait for creating shared engines.
pub trait IntoShared {
    /// Convert into a shared engine reference.
    fn into_shared(self) -> SharedEngine;
}

impl IntoShared for BridgeEngine {
    fn into_shared(self) -> SharedEngine {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_creation() {
        let engine = BridgeEngine::new(EngineConfig::default()).unwrap();
        assert!(!engine.fuel_enabled());
    }

    #[test]
    fn test_engine_with_fuel() {
        let engine = BridgeEngine::new(EngineConfig::default().with_fuel(1_000)).unwrap();
        assert!(engine.fuel_enabled());
        assert_eq!(engine.config().initial_fuel, 1_000);
    }

    #[test]
    fn test_zero_stack_rejected() {
        let result = BridgeEngine::new(EngineConfig::default().with_max_wasm_stack(0));
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_shared_engine() {
        let engine = BridgeEngine::default_engine().unwrap().into_shared();
        let other = Arc::clone(&engine);
        assert_eq!(Arc::strong_count(&other), 2);
    }
}
