//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the wasmtime engine behind a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum WASM stack size in bytes.
    ///
    /// Defaults to 1MB. Closure trampolines re-enter the guest from host
    /// functions, so deep callback chains need stack headroom.
    pub max_wasm_stack: usize,

    /// Enable debug information in compiled code.
    pub debug_info: bool,

    /// Enable fuel-based CPU limiting.
    pub fuel_enabled: bool,

    /// Fuel given to each instance when fuel is enabled.
    pub initial_fuel: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_wasm_stack: 1024 * 1024, // 1MB
            debug_info: false,
            fuel_enabled: false,
            initial_fuel: 10_000_000,
        }
    }
}

impl EngineConfig {
    /// Create a new engine configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable fuel-based CPU limiting with the given budget per instance.
    pub fn with_fuel(mut self, initial_fuel: u64) -> Self {
        self.fuel_enabled = true;
        self.initial_fuel = initial_fuel;
        self
    }

    /// Set the maximum WASM stack size.
    pub fn with_max_wasm_stack(mut self, bytes: usize) -> Self {
        self.max_wasm_stack = bytes;
        self
    }

    /// Enable debug information.
    pub fn with_debug_info(mut self, enabled: bool) -> Self {
        self.debug_info = enabled;
        self
    }

    /// Configuration for development: debug info and a larger stack.
    pub fn development() -> Self {
        Self::default()
            .with_debug_info(true)
            .with_max_wasm_stack(2 * 1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = EngineConfig::new().with_fuel(500).with_max_wasm_stack(4096);
        assert!(config.fuel_enabled);
        assert_eq!(config.initial_fuel, 500);
        assert_eq!(config.max_wasm_stack, 4096);
    }

    #[test]
    fn test_development_preset() {
        let config = EngineConfig::development();
        assert!(config.debug_info);
        assert!(!config.fuel_enabled);
    }
}
