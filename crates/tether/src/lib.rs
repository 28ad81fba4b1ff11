//! # Tether - WebAssembly Guest/Host Bridge
//!
//! Tether lets a WebAssembly guest, which can only hold integers and byte
//! offsets, drive rich host objects: strings, numbers, opaque native objects,
//! callbacks and errors.
//!
//! ## Features
//!
//! - **Handles**: host values addressed by 32-bit handles with slot reuse
//! - **Strings**: UTF-8 marshaling through the guest's own allocator
//! - **Closures**: reference-counted host wrappers around guest closures
//! - **Errors**: host failures become a pending error instead of a trap
//!
//! ## Quick Start
//!
//! ```ignore
//! use tether::prelude::*;
//!
//! let runtime = Tether::builder()
//!     .with_free_policy(FreePolicy::Strict)
//!     .with_fuel_limit(1_000_000)
//!     .build()?;
//!
//! let module = runtime.load_file("app.wasm")?;
//! let linker = runtime.linker()?;
//! let mut instance = runtime.instantiate(&linker, &module, ())?;
//!
//! let greeting = instance.alloc_value("world")?;
//! instance.call::<i32, ()>("greet", greeting.into())?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Your Application                     │
//! ├─────────────────────────────────────────────────────────┤
//! │                     tether (facade)                     │
//! ├────────────────────────────┬────────────────────────────┤
//! │  tether-host               │  tether-core               │
//! │  (engine, linker,          │  (handles, views, strings, │
//! │   intrinsics, instances)   │   closures, pending error) │
//! ├────────────────────────────┴────────────────────────────┤
//! │                       Wasmtime                          │
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::path::Path;
use std::sync::Arc;

use tether_core::{BridgeConfig, FreePolicy};
use tether_host::{
    BridgeEngine, BridgeInstance, BridgeLinker, EngineConfig, ExecutionError, ModuleLoader,
    SharedEngine, ValidatedModule,
};
use tracing::debug;

// Re-export from sub-crates
pub use tether_core;
pub use tether_host;

/// Main entry point for Tether.
pub struct Tether;

impl Tether {
    /// Create a new Tether runtime builder.
    pub fn builder() -> TetherBuilder {
        TetherBuilder::new()
    }

    /// Create a runtime with default configuration.
    pub fn with_defaults() -> Result<TetherRuntime, TetherError> {
        TetherBuilder::new().build()
    }
}

/// Builder for configuring the Tether runtime.
#[derive(Debug, Clone, Default)]
pub struct TetherBuilder {
    engine_config: EngineConfig,
    bridge_config: BridgeConfig,
}

impl TetherBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    // Engine configuration

    /// Enable or disable debug info.
    pub fn with_debug_info(mut self, enabled: bool) -> Self {
        self.engine_config.debug_info = enabled;
        self
    }

    /// Enable fuel metering with the given budget per instance.
    pub fn with_fuel_limit(mut self, fuel: u64) -> Self {
        self.engine_config = self.engine_config.with_fuel(fuel);
        self
    }

    /// Set the maximum WebAssembly stack size in bytes.
    pub fn with_max_wasm_stack(mut self, bytes: usize) -> Self {
        self.engine_config.max_wasm_stack = bytes;
        self
    }

    /// Replace the whole engine configuration.
    pub fn with_engine_config(mut self, config: EngineConfig) -> Self {
        self.engine_config = config;
        self
    }

    // Bridge configuration

    /// Set how double frees are treated.
    pub fn with_free_policy(mut self, policy: FreePolicy) -> Self {
        self.bridge_config = self.bridge_config.with_free_policy(policy);
        self
    }

    /// Set the maximum number of handles per instance.
    pub fn with_max_handles(mut self, max: u32) -> Self {
        self.bridge_config = self.bridge_config.with_max_handles(max);
        self
    }

    /// Replace the whole bridge configuration.
    pub fn with_bridge_config(mut self, config: BridgeConfig) -> Self {
        self.bridge_config = config;
        self
    }

    /// Build the runtime.
    pub fn build(self) -> Result<TetherRuntime, TetherError> {
        let engine = BridgeEngine::new(self.engine_config)?;
        Ok(TetherRuntime {
            engine: Arc::new(engine),
            bridge_config: self.bridge_config,
        })
    }
}

/// A configured Tether runtime.
pub struct TetherRuntime {
    engine: SharedEngine,
    bridge_config: BridgeConfig,
}

impl TetherRuntime {
    /// Get a reference to the engine.
    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    /// The bridge configuration given to new instances.
    pub fn bridge_config(&self) -> &BridgeConfig {
        &self.bridge_config
    }

    /// Create a module loader.
    pub fn loader(&self) -> ModuleLoader {
        ModuleLoader::new(Arc::clone(&self.engine))
    }

    /// Load a module from bytes.
    pub fn load_bytes(&self, bytes: &[u8]) -> Result<ValidatedModule, TetherError> {
        Ok(self.loader().load_bytes(bytes)?)
    }

    /// Load a module from a file.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ValidatedModule, TetherError> {
        Ok(self.loader().load_file(path.as_ref())?)
    }

    /// Load a module from WAT text format.
    pub fn load_wat(&self, wat: &str) -> Result<ValidatedModule, TetherError> {
        Ok(self.loader().load_wat(wat)?)
    }

    /// Create a linker with the bridge intrinsics defined.
    pub fn linker<S: Send + 'static>(&self) -> Result<BridgeLinker<S>, TetherError> {
        Ok(BridgeLinker::new(self.engine.inner()).with_intrinsics()?)
    }

    /// Instantiate a module with the runtime's bridge configuration.
    pub fn instantiate<S: Send + 'static>(
        &self,
        linker: &BridgeLinker<S>,
        module: &ValidatedModule,
        state: S,
    ) -> Result<BridgeInstance<S>, TetherError> {
        debug!(module_name = ?module.name(), "Instantiating module");
        Ok(BridgeInstance::new(
            Arc::clone(&self.engine),
            linker,
            module,
            self.bridge_config.clone(),
            state,
        )?)
    }
}

impl std::fmt::Debug for TetherRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TetherRuntime")
            .field("engine", &self.engine)
            .field("bridge_config", &self.bridge_config)
            .finish()
    }
}

/// Errors from the Tether runtime.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// Engine error.
    #[error("Engine error: {0}")]
    Engine(#[from] tether_host::EngineError),

    /// Module error.
    #[error("Module error: {0}")]
    Module(#[from] tether_host::ModuleError),

    /// Host function registration error.
    #[error("Host error: {0}")]
    Host(#[from] tether_host::HostError),

    /// Execution error.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
}

/// Prelude module for convenient imports.
pub mod prelude {
    // Main types
    pub use crate::{Tether, TetherBuilder, TetherError, TetherRuntime};

    // Kernel types
    pub use tether_core::{
        Bridge, BridgeConfig, BridgeError, BridgeStats, FreePolicy, GuestSlice, GuestVal, Handle,
        HostException, HostObject, HostValue,
    };

    // Host types
    pub use tether_host::{
        BridgeData, BridgeInstance, BridgeLinker, EngineConfig, ExecutionError, IntoShimContext,
        ShimContext, ValidatedModule,
    };

    pub use wasmtime::Caller;
}
