//! Tether Host - Wasmtime Bindings for the Bridge
//!
//! This crate connects the engine-agnostic kernel in `tether-core` to
//! wasmtime:
//!
//! - [`BridgeEngine`]: configured wasmtime engine
//! - [`ModuleLoader`]: loads modules and reports their bridge ABI
//! - [`BridgeLinker`]: linker with the `tether` intrinsics
//! - [`BridgeInstance`]: an instantiated guest and its bridge
//! - [`ShimContext`]: what a host function sees of the bridge
//!
//! # Guest ABI
//!
//! A guest must export `memory` and `__tether_malloc(size, align) -> ptr`.
//! It may export `__tether_realloc`, `__tether_free`, an
//! `__indirect_function_table` holding its closure trampolines, and a
//! `__tether_start` function that runs after instantiation.
//!
//! # Example
//!
//! ```ignore
//! use tether_host::prelude::*;
//!
//! let engine = BridgeEngine::default_engine()?.into_shared();
//! let module = ModuleLoader::new(engine.clone()).load_file(path)?;
//!
//! let mut linker = BridgeLinker::new(engine.inner()).with_intrinsics()?;
//! linker.func_wrap("env", "log", |caller: Caller<'_, BridgeData<()>>, ptr: i32, len: i32| {
//!     let mut ctx = caller.into_shim()?;
//!     let message = ctx.read_string(ptr as u32, len as u32)?;
//!     println!("guest: {message}");
//!     Ok(())
//! })?;
//!
//! let mut instance = BridgeInstance::new(engine, &linker, &module, BridgeConfig::default(), ())?;
//! instance.call::<(), ()>("main", ())?;
//! ```

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod guest;
pub mod instance;
pub mod linker;
pub mod module;

// Re-export main types
pub use config::EngineConfig;
pub use context::{IntoShimContext, ShimContext};
pub use engine::{BridgeEngine, IntoShared, SharedEngine};
pub use error::{
    EngineError, EngineResult, ExecutionError, ExecutionResult, HostError, HostResult,
    ModuleError, ModuleResult, TrapInfo,
};
pub use guest::{GuestExports, WasmGuest};
pub use instance::{BridgeData, BridgeInstance, InstanceId};
pub use linker::{BridgeLinker, INTRINSICS_MODULE, RegisteredFunction};
pub use module::{
    BridgeAbi, ExportInfo, ExternKind, ImportInfo, MemoryInfo, ModuleLoader, ModuleMetadata,
    ValidatedModule, validate_abi,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::context::{IntoShimContext, ShimContext};
    pub use crate::engine::{BridgeEngine, IntoShared, SharedEngine};
    pub use crate::error::{ExecutionError, ExecutionResult, HostError};
    pub use crate::instance::{BridgeData, BridgeInstance};
    pub use crate::linker::BridgeLinker;
    pub use crate::module::{ModuleLoader, ValidatedModule};
    pub use tether_core::prelude::*;
    pub use wasmtime::Caller;
}
