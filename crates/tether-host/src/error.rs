//! Error types for the wasmtime host layer.
//!
//! Bridge defects raised inside a host function travel through wasmtime as
//! the trap's error value and are recovered on the calling side, so a caller
//! sees the original [`BridgeError`] rather than a generic trap.

use tether_core::BridgeError;
use thiserror::Error;

/// Errors during engine creation and configuration.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid engine configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying Wasmtime error.
    #[error("Wasmtime error: {0}")]
    Wasmtime(#[from] wasmtime::Error),
}

/// Errors during module loading and ABI validation.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// The WASM module is invalid or malformed.
    #[error("Invalid WASM module: {0}")]
    Invalid(String),

    /// IO error reading the module.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An export the bridge depends on is absent.
    #[error("Missing bridge export '{0}'")]
    MissingExport(&'static str),

    /// A bridge export has the wrong type.
    #[error("Bridge export '{name}' has the wrong type: expected {expected}")]
    AbiMismatch {
        /// The export name.
        name: &'static str,
        /// Expected signature.
        expected: &'static str,
    },

    /// Underlying Wasmtime error.
    #[error("Wasmtime error: {0}")]
    Wasmtime(#[from] wasmtime::Error),
}

/// Errors raised by host functions and their registration.
#[derive(Debug, Error)]
pub enum HostError {
    /// The guest raised an error through the `throw` intrinsic.
    #[error("Guest threw: {0}")]
    Thrown(String),

    /// Function registration failed.
    #[error("Failed to register function '{module}::{name}': {reason}")]
    RegistrationFailed {
        /// The module name.
        module: String,
        /// The function name.
        name: String,
        /// The reason for failure.
        reason: String,
    },

    /// Function already registered.
    #[error("Function already registered: {module}::{name}")]
    AlreadyRegistered {
        /// The module name.
        module: String,
        /// The function name.
        name: String,
    },
}

/// Errors during instantiation and execution.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A WASM trap occurred during execution.
    #[error("WASM trap: {0}")]
    Trap(#[from] TrapInfo),

    /// A bridge operation failed with a defect.
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    /// A host function failed.
    #[error("Host function error: {0}")]
    Host(#[from] HostError),

    /// The module does not satisfy the bridge ABI.
    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    /// Execution ran out of fuel.
    #[error("Out of fuel: limit was {limit}")]
    OutOfFuel {
        /// The fuel limit that was set.
        limit: u64,
    },

    /// The requested function was not found in the module.
    #[error("Function not found: '{0}'")]
    FunctionNotFound(String),

    /// Underlying Wasmtime error.
    #[error("Wasmtime error: {0}")]
    Wasmtime(wasmtime::Error),
}

/// Information about a WASM trap.
#[derive(Debug, Clone)]
pub struct TrapInfo {
    /// The trap code name, if available.
    pub code: Option<String>,
    /// Human-readable trap message.
    pub message: String,
    /// Stack backtrace, if available.
    pub backtrace: Option<String>,
}

impl std::fmt::Display for TrapInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(code) = &self.code {
            write!(f, "[{}] {}", code, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for TrapInfo {}

impl From<wasmtime::Trap> for TrapInfo {
    fn from(trap: wasmtime::Trap) -> Self {
        Self {
            code: Some(format!("{trap:?}")),
            message: trap.to_string(),
            backtrace: None,
        }
    }
}

impl ExecutionError {
    /// Classify an error returned by a wasmtime call.
    ///
    /// Bridge and host errors raised inside host functions are unwrapped;
    /// traps keep their code and backtrace.
    pub fn from_call(err: wasmtime::Error, fuel_limit: Option<u64>) -> Self {
        let err = match err.downcast::<BridgeError>() {
            Ok(bridge) => return Self::Bridge(bridge),
            Err(err) => err,
        };
        let err = match err.downcast::<HostError>() {
            Ok(host) => return Self::Host(host),
            Err(err) => err,
        };

        if let Some(trap) = err.downcast_ref::<wasmtime::Trap>() {
            if *trap == wasmtime::Trap::OutOfFuel {
                if let Some(limit) = fuel_limit {
                    return Self::OutOfFuel { limit };
                }
            }
            return Self::Trap(TrapInfo {
                code: Some(format!("{trap:?}")),
                message: trap.to_string(),
                backtrace: err
                    .downcast_ref::<wasmtime::WasmBacktrace>()
                    .map(|bt| bt.to_string()),
            });
        }

        Self::Wasmtime(err)
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Result type alias for module operations.
pub type ModuleResult<T> = std::result::Result<T, ModuleError>;

/// Result type for host function registration.
pub type HostResult<T> = std::result::Result<T, HostError>;

/// Result type alias for execution operations.
pub type ExecutionResult<T> = std::result::Result<T, ExecutionError>;
