//! Linker wrapper and the bridge intrinsics.
//!
//! [`BridgeLinker`] wraps Wasmtime's `Linker` over [`BridgeData`], tracks what
//! has been registered and provides [`BridgeLinker::with_intrinsics`], which
//! defines the functions a guest imports from the [`INTRINSICS_MODULE`]
//! namespace to manipulate handles, strings, errors and closures.

use tether_core::{ClosureSpec, GuestSlice, Handle, HostValue};
use tracing::{debug, info};
use wasmtime::{Caller, Engine, IntoFunc, Linker};

use crate::context::IntoShimContext;
use crate::error::{HostError, HostResult};
use crate::instance::BridgeData;
use crate::module::ValidatedModule;

/// Import namespace of the bridge intrinsics.
pub const INTRINSICS_MODULE: &str = "tether";

/// Returned by `boolean_get` when the handle is not a boolean.
pub const NOT_A_BOOLEAN: i32 = 0xFF_FFFF;

/// Information about a registered host function.
#[derive(Debug, Clone)]
pub struct RegisteredFunction {
    /// The import module name.
    pub module: String,
    /// The function name.
    pub name: String,
    /// Human-readable description.
    pub description: Option<String>,
}

/// A wrapper around Wasmtime's `Linker` for bridge instances.
pub struct BridgeLinker<S> {
    inner: Linker<BridgeData<S>>,
    registered: Vec<RegisteredFunction>,
}

impl<S: 'static> BridgeLinker<S> {
    /// Create a new linker for the given engine.
    pub fn new(engine: &Engine) -> Self {
        Self {
            inner: Linker::new(engine),
            registered: Vec::new(),
        }
    }

    /// Get a reference to the underlying Wasmtime linker.
    pub fn inner(&self) -> &Linker<BridgeData<S>> {
        &self.inner
    }

    /// Get a mutable reference to the underlying Wasmtime linker.
    pub fn inner_mut(&mut self) -> &mut Linker<BridgeData<S>> {
        &mut self.inner
    }

    /// Get the list of registered functions.
    pub fn registered_functions(&self) -> &[RegisteredFunction] {
        &self.registered
    }

    /// Check if a function is already registered.
    pub fn is_registered(&self, module: &str, name: &str) -> bool {
        self.registered
            .iter()
            .any(|f| f.module == module && f.name == name)
    }

    /// Register a host function.
    pub fn func_wrap<Params, Results>(
        &mut self,
        module: &str,
        name: &str,
        func: impl IntoFunc<BridgeData<S>, Params, Results>,
    ) -> HostResult<&mut Self> {
        self.func_wrap_described(module, name, None, func)
    }

    /// Register a host function with a description.
    pub fn func_wrap_described<Params, Results>(
        &mut self,
        module: &str,
        name: &str,
        description: Option<&str>,
        func: impl IntoFunc<BridgeData<S>, Params, Results>,
    ) -> HostResult<&mut Self> {
        if self.is_registered(module, name) {
            return Err(HostError::AlreadyRegistered {
                module: module.to_string(),
                name: name.to_string(),
            });
        }

        self.inner
            .func_wrap(module, name, func)
            .map_err(|e| HostError::RegistrationFailed {
                module: module.to_string(),
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        self.registered.push(RegisteredFunction {
            module: module.to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
        });

        debug!(module, name, "Registered host function");
        Ok(self)
    }

    /// Define every import of `module` that is still missing as a function
    /// that traps when called.
    pub fn trap_unknown_imports(&mut self, module: &ValidatedModule) -> HostResult<&mut Self> {
        self.inner
            .define_unknown_imports_as_traps(module.inner())
            .map_err(|e| HostError::RegistrationFailed {
                module: "*".to_string(),
                name: "*".to_string(),
                reason: e.to_string(),
            })?;
        Ok(self)
    }

    /// Consume the linker and return it with the intrinsics defined.
    pub fn with_intrinsics(mut self) -> HostResult<Self> {
        self.define_intrinsics()?;
        Ok(self)
    }

    /// Define the bridge intrinsics under [`INTRINSICS_MODULE`].
    pub fn define_intrinsics(&mut self) -> HostResult<&mut Self> {
        const M: &str = INTRINSICS_MODULE;

        self.func_wrap_described(
            M,
            "object_drop",
            Some("Release a handle"),
            |caller: Caller<'_, BridgeData<S>>, handle: i32| -> wasmtime::Result<()> {
                caller.data().bridge().free(Handle::from(handle))?;
                Ok(())
            },
        )?;

        self.func_wrap_described(
            M,
            "object_clone",
            Some("Duplicate a handle"),
            |caller: Caller<'_, BridgeData<S>>, handle: i32| -> wasmtime::Result<i32> {
                let bridge = caller.data().bridge();
                let clone = bridge.guard(|| bridge.duplicate(Handle::from(handle)))?;
                Ok(clone.into())
            },
        )?;

        self.func_wrap_described(
            M,
            "is_undefined",
            None,
            |caller: Caller<'_, BridgeData<S>>, handle: i32| -> wasmtime::Result<i32> {
                let bridge = caller.data().bridge();
                let found = bridge.with_value(Handle::from(handle), |value| {
                    matches!(value, HostValue::Undefined)
                })?;
                Ok(found.into())
            },
        )?;

        self.func_wrap_described(
            M,
            "is_null",
            None,
            |caller: Caller<'_, BridgeData<S>>, handle: i32| -> wasmtime::Result<i32> {
                let bridge = caller.data().bridge();
                let found = bridge
                    .with_value(Handle::from(handle), |value| matches!(value, HostValue::Null))?;
                Ok(found.into())
            },
        )?;

        self.func_wrap_described(
            M,
            "is_function",
            None,
            |caller: Caller<'_, BridgeData<S>>, handle: i32| -> wasmtime::Result<i32> {
                let bridge = caller.data().bridge();
                let found = bridge.with_value(Handle::from(handle), HostValue::is_function)?;
                Ok(found.into())
            },
        )?;

        self.func_wrap_described(
            M,
            "boolean_get",
            Some("1 or 0 for booleans, 0xFFFFFF otherwise"),
            |caller: Caller<'_, BridgeData<S>>, handle: i32| -> wasmtime::Result<i32> {
                let bridge = caller.data().bridge();
                let value = bridge.with_value(Handle::from(handle), HostValue::as_bool)?;
                Ok(value.map_or(NOT_A_BOOLEAN, i32::from))
            },
        )?;

        self.func_wrap_described(
            M,
            "number_new",
            None,
            |caller: Caller<'_, BridgeData<S>>, value: f64| -> wasmtime::Result<i32> {
                let bridge = caller.data().bridge();
                let handle = bridge.guard(|| bridge.alloc(value))?;
                Ok(handle.into())
            },
        )?;

        self.func_wrap_described(
            M,
            "number_get",
            Some("Write (is_some: i32, value: f64) at ret and ret + 8"),
            |caller: Caller<'_, BridgeData<S>>, ret: i32, handle: i32| -> wasmtime::Result<()> {
                let mut ctx = caller.into_shim()?;
                let number = ctx
                    .bridge()
                    .with_value(Handle::from(handle), HostValue::as_f64)?;
                let ret = ret as u32;
                ctx.store(ret.wrapping_add(8), number.unwrap_or(0.0))?;
                ctx.store(ret, i32::from(number.is_some()))?;
                Ok(())
            },
        )?;

        self.func_wrap_described(
            M,
            "string_new",
            Some("Decode a UTF-8 string and return its handle"),
            |caller: Caller<'_, BridgeData<S>>, ptr: i32, len: i32| -> wasmtime::Result<i32> {
                let mut ctx = caller.into_shim()?;
                let handle = ctx.guarded(|ctx| {
                    let text = ctx.read_string(ptr as u32, len as u32)?;
                    ctx.alloc(text)
                })?;
                Ok(handle.into())
            },
        )?;

        self.func_wrap_described(
            M,
            "string_get",
            Some("Write (ptr, len) of a guest copy at ret, or (0, 0)"),
            |caller: Caller<'_, BridgeData<S>>, ret: i32, handle: i32| -> wasmtime::Result<()> {
                let mut ctx = caller.into_shim()?;
                let text = ctx
                    .bridge()
                    .with_value(Handle::from(handle), |value| value.as_str().map(str::to_owned))?;
                let slice = match text {
                    Some(text) => ctx.write_string(&text)?,
                    None => GuestSlice::default(),
                };
                ctx.write_slice(ret as u32, slice)?;
                Ok(())
            },
        )?;

        self.func_wrap_described(
            M,
            "debug_string",
            Some("Write (ptr, len) of a diagnostic rendering at ret"),
            |caller: Caller<'_, BridgeData<S>>, ret: i32, handle: i32| -> wasmtime::Result<()> {
                let mut ctx = caller.into_shim()?;
                let text = ctx
                    .bridge()
                    .with_value(Handle::from(handle), HostValue::debug_string)?;
                let slice = ctx.write_string(&text)?;
                ctx.write_slice(ret as u32, slice)?;
                Ok(())
            },
        )?;

        self.func_wrap_described(
            M,
            "throw",
            Some("Abort the current call with a message"),
            |caller: Caller<'_, BridgeData<S>>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                let mut ctx = caller.into_shim()?;
                let message = ctx.read_string(ptr as u32, len as u32)?;
                Err(HostError::Thrown(message).into())
            },
        )?;

        self.func_wrap_described(
            M,
            "take_pending_error",
            Some("Drain the pending-error slot, 0 when empty"),
            |caller: Caller<'_, BridgeData<S>>| -> i32 {
                caller
                    .data()
                    .bridge()
                    .take_pending_error()
                    .map_or(0, i32::from)
            },
        )?;

        self.func_wrap_described(
            M,
            "closure_new",
            Some("Wrap a guest closure (data, dispatch, destroy, invoke)"),
            |caller: Caller<'_, BridgeData<S>>,
             data: i32,
             dispatch: i32,
             destroy: i32,
             invoke: i32|
             -> wasmtime::Result<i32> {
                let spec = ClosureSpec {
                    data: data as u32,
                    dispatch: dispatch as u32,
                    destroy: destroy as u32,
                    invoke: invoke as u32,
                };
                let bridge = caller.data().bridge();
                let handle = bridge.guard(|| bridge.closure_new(spec))?;
                Ok(handle.into())
            },
        )?;

        self.func_wrap_described(
            M,
            "closure_unref",
            Some("Release the guest's reference to a closure"),
            |caller: Caller<'_, BridgeData<S>>, handle: i32| -> wasmtime::Result<()> {
                let mut ctx = caller.into_shim()?;
                ctx.closure_unref(Handle::from(handle))?;
                Ok(())
            },
        )?;

        info!(
            functions = self.registered.len(),
            module = INTRINSICS_MODULE,
            "Defined bridge intrinsics"
        );
        Ok(self)
    }
}

impl<S> std::fmt::Debug for BridgeLinker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeLinker")
            .field("registered_functions", &self.registered.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_engine() -> Engine {
        Engine::default()
    }

    #[test]
    fn test_linker_creation() {
        let engine = create_engine();
        let linker = BridgeLinker::<()>::new(&engine);
        assert!(linker.registered_functions().is_empty());
    }

    #[test]
    fn test_func_wrap() {
        let engine = create_engine();
        let mut linker = BridgeLinker::<()>::new(&engine);

        linker
            .func_wrap("env", "answer", |_: i32| -> i32 { 42 })
            .unwrap();

        assert!(linker.is_registered("env", "answer"));
        assert_eq!(linker.registered_functions().len(), 1);
    }

    #[test]
    fn test_duplicate_registration() {
        let engine = create_engine();
        let mut linker = BridgeLinker::<()>::new(&engine);

        linker
            .func_wrap("env", "answer", |_: i32| -> i32 { 42 })
            .unwrap();

        let result = linker.func_wrap("env", "answer", |_: i32| -> i32 { 0 });
        assert!(matches!(result, Err(HostError::AlreadyRegistered { .. })));
    }

    #[test]
    fn test_intrinsics_registered() {
        let engine = create_engine();
        let linker = BridgeLinker::<()>::new(&engine).with_intrinsics().unwrap();

        for name in ["object_drop", "string_new", "string_get", "closure_new", "throw"] {
            assert!(linker.is_registered(INTRINSICS_MODULE, name), "{name}");
        }
        assert_eq!(linker.registered_functions().len(), 15);
    }

    #[test]
    fn test_intrinsics_twice_fails() {
        let engine = create_engine();
        let mut linker = BridgeLinker::<()>::new(&engine).with_intrinsics().unwrap();
        assert!(linker.define_intrinsics().is_err());
    }
}
