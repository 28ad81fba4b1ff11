//! Bridge instances.
//!
//! A [`BridgeInstance`] is one instantiated guest module together with the
//! [`Bridge`] that gives its handles meaning. The bridge travels in the
//! store's [`BridgeData`], so host functions reach it through the caller and
//! the embedder reaches it through the instance.

use tether_core::{
    Bridge, BridgeConfig, BridgeStats, GuestSlice, GuestVal, Handle, HostException, HostValue,
    TeardownSummary,
};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wasmtime::{FuncType, Instance, Store, Val, WasmParams, WasmResults};

use crate::engine::SharedEngine;
use crate::error::{ExecutionError, ExecutionResult};
use crate::guest::{GuestExports, WasmGuest};
use crate::linker::BridgeLinker;
use crate::module::{START_EXPORT, ValidatedModule, validate_abi};

/// Unique identifier for a bridge instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Create a new random instance ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Internal data stored in the Wasmtime Store.
pub struct BridgeData<S = ()> {
    /// Unique identifier for this instance.
    pub id: InstanceId,
    bridge: Bridge,
    exports: Option<GuestExports>,
    /// User-provided state.
    pub user_state: S,
}

impl<S> BridgeData<S> {
    /// The instance's bridge.
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// The resolved guest exports, once instantiation has finished.
    pub fn exports(&self) -> Option<&GuestExports> {
        self.exports.as_ref()
    }

    /// Access the user state.
    pub fn state(&self) -> &S {
        &self.user_state
    }

    /// Access the user state mutably.
    pub fn state_mut(&mut self) -> &mut S {
        &mut self.user_state
    }
}

/// An instantiated guest module with its bridge.
///
/// Every top-level call is followed by a reclamation pass that destroys
/// closures the host dropped while the guest still owned them.
///
/// # Example
///
/// ```ignore
/// let linker = BridgeLinker::new(engine.inner()).with_intrinsics()?;
/// let mut instance = BridgeInstance::new(engine, &linker, &module, BridgeConfig::default(), ())?;
///
/// let name = instance.alloc_value("world")?;
/// let greeting: i32 = instance.call("greet", i32::from(name))?;
/// ```
pub struct BridgeInstance<S = ()> {
    engine: SharedEngine,
    store: Store<BridgeData<S>>,
    instance: Instance,
    exports: GuestExports,
    module: ValidatedModule,
}

impl<S: Send + 'static> BridgeInstance<S> {
    /// Instantiate `module` against `linker`.
    ///
    /// The module must satisfy the bridge ABI. If it exports
    /// `__tether_start`, that function runs before this returns.
    pub fn new(
        engine: SharedEngine,
        linker: &BridgeLinker<S>,
        module: &ValidatedModule,
        config: BridgeConfig,
        user_state: S,
    ) -> ExecutionResult<Self> {
        validate_abi(module)?;

        let id = InstanceId::new();
        let data = BridgeData {
            id,
            bridge: Bridge::new(config),
            exports: None,
            user_state,
        };

        let mut store = Store::new(engine.inner(), data);
        let fuel_limit = engine.fuel_enabled().then(|| engine.config().initial_fuel);
        if let Some(fuel) = fuel_limit {
            store.set_fuel(fuel).map_err(ExecutionError::Wasmtime)?;
        }

        let instance = linker
            .inner()
            .instantiate(&mut store, module.inner())
            .map_err(|err| ExecutionError::from_call(err, fuel_limit))?;
        let exports = GuestExports::resolve(&mut store, &instance)?;
        store.data_mut().exports = Some(exports.clone());

        let mut this = Self {
            engine,
            store,
            instance,
            exports,
            module: module.clone(),
        };

        if module.abi().start {
            this.call::<(), ()>(START_EXPORT, ())?;
        }

        info!(
            instance_id = %id,
            module_name = ?module.name(),
            realloc = this.exports.has_realloc(),
            "Created bridge instance"
        );

        Ok(this)
    }

    /// Get the instance ID.
    pub fn id(&self) -> InstanceId {
        self.store.data().id
    }

    /// Get a reference to the engine.
    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    /// The module this instance was created from.
    pub fn module(&self) -> &ValidatedModule {
        &self.module
    }

    /// The instance's bridge.
    pub fn bridge(&self) -> &Bridge {
        self.store.data().bridge()
    }

    /// Access the user state.
    pub fn state(&self) -> &S {
        self.store.data().state()
    }

    /// Access the user state mutably.
    pub fn state_mut(&mut self) -> &mut S {
        self.store.data_mut().state_mut()
    }

    /// The guest, for use with the lower-level [`Bridge`] API.
    pub fn guest(&mut self) -> WasmGuest<&mut Store<BridgeData<S>>> {
        WasmGuest::new(&mut self.store, self.exports.clone())
    }

    fn fuel_limit(&self) -> Option<u64> {
        self.engine
            .fuel_enabled()
            .then(|| self.engine.config().initial_fuel)
    }

    fn classify(&self, function: &str, err: wasmtime::Error) -> ExecutionError {
        let err = ExecutionError::from_call(err, self.fuel_limit());
        warn!(instance_id = %self.id(), function, error = %err, "Guest call failed");
        err
    }

    /// Call an exported function.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let result: i32 = instance.call("add", (2i32, 3i32))?;
    /// ```
    pub fn call<P, R>(&mut self, name: &str, params: P) -> ExecutionResult<R>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let func = self
            .instance
            .get_typed_func::<P, R>(&mut self.store, name)
            .map_err(|_| ExecutionError::FunctionNotFound(name.to_string()))?;

        debug!(instance_id = %self.id(), function = name, "Calling guest function");

        let result = func
            .call(&mut self.store, params)
            .map_err(|err| self.classify(name, err));
        self.finish_call(result)
    }

    /// Call an exported function with dynamic typing.
    pub fn call_dynamic(&mut self, name: &str, params: &[Val]) -> ExecutionResult<Vec<Val>> {
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| ExecutionError::FunctionNotFound(name.to_string()))?;

        let result_count = func.ty(&self.store).results().len();
        let mut results = vec![Val::I32(0); result_count];

        debug!(instance_id = %self.id(), function = name, "Calling guest function (dynamic)");

        let result = func
            .call(&mut self.store, params, &mut results)
            .map_err(|err| self.classify(name, err))
            .map(|()| results);
        self.finish_call(result)
    }

    /// Run the reclamation pass after a top-level call. The call's own
    /// error takes precedence over a reclamation failure.
    fn finish_call<T>(&mut self, result: ExecutionResult<T>) -> ExecutionResult<T> {
        let reclaimed = self.reclaim_closures();
        let value = result?;
        reclaimed?;
        Ok(value)
    }

    /// Get the type signature of an exported function.
    pub fn func_type(&mut self, name: &str) -> Option<FuncType> {
        let func = self.instance.get_func(&mut self.store, name)?;
        Some(func.ty(&self.store))
    }

    /// Store a host value and return its handle.
    pub fn alloc_value(&self, value: impl Into<HostValue>) -> ExecutionResult<Handle> {
        Ok(self.bridge().alloc(value)?)
    }

    /// A clone of the value behind `handle`.
    pub fn value(&self, handle: Handle) -> ExecutionResult<HostValue> {
        Ok(self.bridge().get(handle)?)
    }

    /// Release a handle.
    pub fn free_value(&self, handle: Handle) -> ExecutionResult<()> {
        Ok(self.bridge().free(handle)?)
    }

    /// Copy a string into guest memory.
    pub fn pass_string(&mut self, text: &str) -> ExecutionResult<GuestSlice> {
        let bridge = self.bridge().clone();
        Ok(bridge.encode_string(&mut self.guest(), text)?)
    }

    /// Decode a UTF-8 string from guest memory.
    pub fn read_string(&mut self, ptr: u32, len: u32) -> ExecutionResult<String> {
        let bridge = self.bridge().clone();
        Ok(bridge.decode_string(&self.guest(), ptr, len)?)
    }

    /// Invoke the closure behind `handle` from the host.
    ///
    /// Returns `None` if the guest has already destroyed the closure.
    pub fn invoke_closure(
        &mut self,
        handle: Handle,
        args: &[GuestVal],
    ) -> ExecutionResult<Option<Vec<GuestVal>>> {
        let bridge = self.bridge().clone();
        let result = bridge
            .invoke_closure(&mut self.guest(), handle, args)
            .map_err(ExecutionError::from);
        self.finish_call(result)
    }

    /// Drain the pending-error slot and release its handle.
    pub fn take_pending_error(&self) -> ExecutionResult<Option<HostException>> {
        Ok(self.bridge().take_pending_exception()?)
    }

    /// Destroy closures the host dropped while the guest still owned them.
    pub fn reclaim_closures(&mut self) -> ExecutionResult<usize> {
        let bridge = self.bridge().clone();
        Ok(bridge.reclaim_closures(&mut self.guest())?)
    }

    /// Bridge counters.
    pub fn stats(&self) -> BridgeStats {
        self.bridge().stats()
    }

    /// Get the remaining fuel.
    pub fn remaining_fuel(&self) -> Option<u64> {
        if self.engine.fuel_enabled() {
            self.store.get_fuel().ok()
        } else {
            None
        }
    }

    /// Add more fuel to the instance.
    pub fn add_fuel(&mut self, fuel: u64) -> ExecutionResult<()> {
        if self.engine.fuel_enabled() {
            let current = self.store.get_fuel().map_err(ExecutionError::Wasmtime)?;
            let total = current.saturating_add(fuel);
            self.store.set_fuel(total).map_err(ExecutionError::Wasmtime)?;
            debug!(instance_id = %self.id(), added = fuel, total, "Added fuel");
        }
        Ok(())
    }

    /// Release every host value and destroy leftover closures.
    pub fn teardown(mut self) -> ExecutionResult<TeardownSummary> {
        let id = self.id();
        let bridge = self.bridge().clone();
        let summary = bridge.teardown(&mut self.guest())?;
        info!(
            instance_id = %id,
            handles_released = summary.handles_released,
            closures_reclaimed = summary.closures_reclaimed,
            "Bridge instance torn down"
        );
        Ok(summary)
    }
}

impl<S> std::fmt::Debug for BridgeInstance<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeInstance")
            .field("id", &self.store.data().id)
            .field("module", &self.module.name())
            .field("exports", &self.exports)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::{BridgeEngine, IntoShared};
    use crate::error::HostError;
    use crate::module::ModuleLoader;
    use tether_core::{BridgeError, HandleError};

    const GUEST_WAT: &str = r#"
        (module
            (import "tether" "closure_new" (func $closure_new (param i32 i32 i32 i32) (result i32)))
            (import "tether" "closure_unref" (func $closure_unref (param i32)))
            (import "tether" "object_drop" (func $object_drop (param i32)))
            (import "tether" "string_new" (func $string_new (param i32 i32) (result i32)))
            (import "tether" "string_get" (func $string_get (param i32 i32)))
            (import "tether" "number_get" (func $number_get (param i32 i32)))
            (import "tether" "take_pending_error" (func $take_pending_error (result i32)))
            (import "tether" "throw" (func $throw (param i32 i32)))

            (memory (export "memory") 1)
            (global $heap (mut i32) (i32.const 1024))
            (global $destroyed (mut i32) (i32.const 0))

            (table (export "__indirect_function_table") 2 funcref)
            (elem (i32.const 0) $invoke $destroy)

            (data (i32.const 16) "hello")
            (data (i32.const 32) "\ff\fe")

            (func $malloc (export "__tether_malloc") (param $size i32) (param $align i32) (result i32)
                (local $ptr i32)
                (if (i32.eqz (local.get $align)) (then (local.set $align (i32.const 1))))
                (local.set $ptr
                    (i32.and
                        (i32.add (global.get $heap) (i32.sub (local.get $align) (i32.const 1)))
                        (i32.sub (i32.const 0) (local.get $align))))
                (global.set $heap (i32.add (local.get $ptr) (local.get $size)))
                (block $done
                    (loop $grow
                        (br_if $done
                            (i32.le_u (global.get $heap) (i32.mul (memory.size) (i32.const 65536))))
                        (if (i32.eq (memory.grow (i32.const 1)) (i32.const -1)) (then unreachable))
                        (br $grow)))
                (local.get $ptr))

            (func (export "__tether_realloc") (param $ptr i32) (param $old i32) (param $new i32) (param $align i32) (result i32)
                (local $dst i32)
                (if (i32.le_u (local.get $new) (local.get $old)) (then (return (local.get $ptr))))
                (local.set $dst (call $malloc (local.get $new) (local.get $align)))
                (memory.copy (local.get $dst) (local.get $ptr) (local.get $old))
                (local.get $dst))

            (func (export "__tether_free") (param i32 i32 i32))

            (func $invoke (param $data i32) (param $dispatch i32) (param $arg i32) (result i32)
                (i32.add (i32.add (local.get $data) (local.get $dispatch)) (local.get $arg)))

            (func $destroy (param $data i32) (param $dispatch i32)
                (global.set $destroyed (i32.add (global.get $destroyed) (i32.const 1))))

            (func (export "make_closure") (param $data i32) (result i32)
                (call $closure_new (local.get $data) (i32.const 5) (i32.const 1) (i32.const 0)))
            (func (export "release_closure") (param $h i32)
                (call $closure_unref (local.get $h)))
            (func (export "drop_handle") (param $h i32)
                (call $object_drop (local.get $h)))
            (func (export "decode_hello") (result i32)
                (call $string_new (i32.const 16) (i32.const 5)))
            (func (export "decode_invalid") (result i32)
                (call $string_new (i32.const 32) (i32.const 2)))
            (func (export "take_error") (result i32)
                (call $take_pending_error))
            (func (export "destroyed_count") (result i32)
                (global.get $destroyed))
            (func (export "echo_length") (param $h i32) (result i32)
                (call $string_get (i32.const 8) (local.get $h))
                (i32.load (i32.const 12)))
            (func (export "number_or_minus_one") (param $h i32) (result f64)
                (call $number_get (i32.const 48) (local.get $h))
                (if (result f64) (i32.load (i32.const 48))
                    (then (f64.load (i32.const 56)))
                    (else (f64.const -1))))
            (func (export "fail")
                (call $throw (i32.const 16) (i32.const 5)))
            (func (export "spin")
                (loop $forever (br $forever)))
        )
    "#;

    fn create_instance_with(engine_config: EngineConfig) -> BridgeInstance {
        let engine = BridgeEngine::new(engine_config).unwrap().into_shared();
        let module = ModuleLoader::new(engine.clone()).load_wat(GUEST_WAT).unwrap();
        let linker = BridgeLinker::new(engine.inner()).with_intrinsics().unwrap();
        BridgeInstance::new(engine, &linker, &module, BridgeConfig::strict(), ()).unwrap()
    }

    fn create_instance() -> BridgeInstance {
        create_instance_with(EngineConfig::default())
    }

    #[test]
    fn test_string_new_returns_handle() {
        let mut instance = create_instance();

        let handle: i32 = instance.call("decode_hello", ()).unwrap();
        assert_eq!(handle, 4);
        assert_eq!(
            instance.value(Handle::from(handle)).unwrap(),
            HostValue::from("hello")
        );
    }

    #[test]
    fn test_invalid_utf8_sets_pending_error() {
        let mut instance = create_instance();

        let handle: i32 = instance.call("decode_invalid", ()).unwrap();
        assert_eq!(handle, 0);
        assert!(instance.bridge().has_pending_error());

        let error: i32 = instance.call("take_error", ()).unwrap();
        assert_ne!(error, 0);
        let value = instance.value(Handle::from(error)).unwrap();
        assert!(value.as_error().unwrap().message().contains("Invalid UTF-8"));
        assert!(!instance.bridge().has_pending_error());
    }

    #[test]
    fn test_take_pending_error_from_host() {
        let mut instance = create_instance();

        let _: i32 = instance.call("decode_invalid", ()).unwrap();
        let exception = instance.take_pending_error().unwrap().unwrap();
        assert!(exception.message().contains("Invalid UTF-8"));
        assert!(instance.take_pending_error().unwrap().is_none());
    }

    #[test]
    fn test_closure_invoke_and_release() {
        let mut instance = create_instance();

        let raw: i32 = instance.call("make_closure", 100).unwrap();
        let handle = Handle::from(raw);

        let result = instance
            .invoke_closure(handle, &[GuestVal::I32(1)])
            .unwrap();
        assert_eq!(result, Some(vec![GuestVal::I32(106)]));

        instance.call::<i32, ()>("release_closure", raw).unwrap();
        let destroyed: i32 = instance.call("destroyed_count", ()).unwrap();
        assert_eq!(destroyed, 1);

        let result = instance
            .invoke_closure(handle, &[GuestVal::I32(1)])
            .unwrap();
        assert_eq!(result, None);

        // Dropping the handle afterwards must not destroy twice.
        instance.call::<i32, ()>("drop_handle", raw).unwrap();
        let destroyed: i32 = instance.call("destroyed_count", ()).unwrap();
        assert_eq!(destroyed, 1);
    }

    #[test]
    fn test_dropped_closure_is_reclaimed() {
        let mut instance = create_instance();

        let raw: i32 = instance.call("make_closure", 7).unwrap();
        instance.call::<i32, ()>("drop_handle", raw).unwrap();

        let destroyed: i32 = instance.call("destroyed_count", ()).unwrap();
        assert_eq!(destroyed, 1);
        assert_eq!(instance.stats().live_closures, 0);
    }

    #[test]
    fn test_string_get_copies_into_guest() {
        let mut instance = create_instance();

        let handle = instance.alloc_value("abc€def").unwrap();
        let len: i32 = instance.call("echo_length", i32::from(handle)).unwrap();
        assert_eq!(len, 9);

        let number = instance.alloc_value(42).unwrap();
        let len: i32 = instance.call("echo_length", i32::from(number)).unwrap();
        assert_eq!(len, 0);
    }

    #[test]
    fn test_number_get() {
        let mut instance = create_instance();

        let number = instance.alloc_value(2.5).unwrap();
        let value: f64 = instance
            .call("number_or_minus_one", i32::from(number))
            .unwrap();
        assert_eq!(value, 2.5);

        let text = instance.alloc_value("2.5").unwrap();
        let value: f64 = instance.call("number_or_minus_one", i32::from(text)).unwrap();
        assert_eq!(value, -1.0);
    }

    #[test]
    fn test_pass_and_read_string() {
        let mut instance = create_instance();

        let slice = instance.pass_string("日本語").unwrap();
        assert_eq!(slice.len, 9);
        assert_eq!(instance.read_string(slice.ptr, slice.len).unwrap(), "日本語");
    }

    #[test]
    fn test_throw_surfaces_host_error() {
        let mut instance = create_instance();

        let err = instance.call::<(), ()>("fail", ()).unwrap_err();
        match err {
            ExecutionError::Host(HostError::Thrown(message)) => assert_eq!(message, "hello"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_stale_handle_traps() {
        let mut instance = create_instance();

        let err = instance.call::<i32, ()>("drop_handle", 999).unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Bridge(BridgeError::Handle(HandleError::OutOfRange { .. }))
        ));
    }

    #[test]
    fn test_function_not_found() {
        let mut instance = create_instance();
        let result = instance.call::<(), ()>("missing", ());
        assert!(matches!(result, Err(ExecutionError::FunctionNotFound(_))));
    }

    #[test]
    fn test_out_of_fuel() {
        let mut instance = create_instance_with(EngineConfig::default().with_fuel(10_000));

        let err = instance.call::<(), ()>("spin", ()).unwrap_err();
        assert!(matches!(err, ExecutionError::OutOfFuel { limit: 10_000 }));
    }

    #[test]
    fn test_call_dynamic() {
        let mut instance = create_instance();

        let results = instance
            .call_dynamic("make_closure", &[Val::I32(3)])
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].i32(), Some(4));
    }

    #[test]
    fn test_teardown_reclaims_closures() {
        let mut instance = create_instance();

        let _: i32 = instance.call("make_closure", 1).unwrap();
        let _ = instance.alloc_value("left over").unwrap();

        let summary = instance.teardown().unwrap();
        assert_eq!(summary.handles_released, 2);
        assert_eq!(summary.closures_reclaimed, 1);
    }

    #[test]
    fn test_missing_malloc_rejected() {
        let engine = BridgeEngine::default_engine().unwrap().into_shared();
        let module = ModuleLoader::new(engine.clone())
            .load_wat(r#"(module (memory (export "memory") 1))"#)
            .unwrap();
        let linker = BridgeLinker::<()>::new(engine.inner());

        let result = BridgeInstance::new(engine, &linker, &module, BridgeConfig::default(), ());
        assert!(matches!(result, Err(ExecutionError::Module(_))));
    }
}
