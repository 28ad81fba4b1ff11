//! Host function execution context.
//!
//! Host functions registered on a [`BridgeLinker`](crate::linker::BridgeLinker)
//! receive a wasmtime `Caller`. [`ShimContext`] wraps it together with the
//! instance's [`Bridge`] and exports, so a host function can read guest
//! strings, hand out handles and call back into the guest without touching
//! wasmtime directly.

use tether_core::{
    Bridge, BridgeResult, Element, GuestSlice, GuestVal, Handle, HostValue, Sentinel,
};
use wasmtime::Caller;

use crate::guest::{GuestExports, WasmGuest};
use crate::instance::BridgeData;

/// Context available to host function implementations.
pub struct ShimContext<'a, S> {
    caller: Caller<'a, BridgeData<S>>,
    bridge: Bridge,
    exports: GuestExports,
}

impl<'a, S> ShimContext<'a, S> {
    /// Create a context for the calling instance.
    ///
    /// Exports are taken from the store once the instance is running; during
    /// instantiation they are resolved from the caller.
    pub fn new(mut caller: Caller<'a, BridgeData<S>>) -> wasmtime::Result<Self> {
        let bridge = caller.data().bridge().clone();
        let cached = caller.data().exports().cloned();
        let exports = match cached {
            Some(exports) => exports,
            None => GuestExports::from_caller(&mut caller)?,
        };
        Ok(Self {
            caller,
            bridge,
            exports,
        })
    }

    /// The instance's bridge.
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Get a reference to the underlying Wasmtime caller.
    pub fn caller(&self) -> &Caller<'a, BridgeData<S>> {
        &self.caller
    }

    /// Get a mutable reference to the underlying Wasmtime caller.
    pub fn caller_mut(&mut self) -> &mut Caller<'a, BridgeData<S>> {
        &mut self.caller
    }

    /// The embedder state.
    pub fn state(&self) -> &S {
        self.caller.data().state()
    }

    /// The embedder state, mutably.
    pub fn state_mut(&mut self) -> &mut S {
        self.caller.data_mut().state_mut()
    }

    /// The calling guest, for use with the lower-level [`Bridge`] API.
    pub fn guest(&mut self) -> WasmGuest<&mut Caller<'a, BridgeData<S>>> {
        WasmGuest::new(&mut self.caller, self.exports.clone())
    }

    fn parts(&mut self) -> (&Bridge, WasmGuest<&mut Caller<'a, BridgeData<S>>>) {
        (
            &self.bridge,
            WasmGuest::new(&mut self.caller, self.exports.clone()),
        )
    }

    /// A clone of the value behind `handle`.
    pub fn value(&self, handle: Handle) -> BridgeResult<HostValue> {
        self.bridge.get(handle)
    }

    /// Store a value and return its handle.
    pub fn alloc(&self, value: impl Into<HostValue>) -> BridgeResult<Handle> {
        self.bridge.alloc(value)
    }

    /// Release a handle.
    pub fn free(&self, handle: Handle) -> BridgeResult<()> {
        self.bridge.free(handle)
    }

    /// Decode a UTF-8 string from guest memory.
    pub fn read_string(&mut self, ptr: u32, len: u32) -> BridgeResult<String> {
        let (bridge, guest) = self.parts();
        bridge.decode_string(&guest, ptr, len)
    }

    /// Copy a string into a fresh guest allocation.
    pub fn write_string(&mut self, text: &str) -> BridgeResult<GuestSlice> {
        let (bridge, mut guest) = self.parts();
        bridge.encode_string(&mut guest, text)
    }

    /// Write a `(ptr, len)` pair into a guest return area.
    pub fn write_slice(&mut self, ret: u32, slice: GuestSlice) -> BridgeResult<()> {
        self.store(ret, slice.ptr)?;
        self.store(ret.wrapping_add(4), slice.len)
    }

    /// Copy `count` elements starting at byte pointer `ptr`.
    pub fn read_array<T: Element>(&mut self, ptr: u32, count: usize) -> BridgeResult<Vec<T>> {
        let (bridge, guest) = self.parts();
        let view = bridge.views().view_at::<T, _>(&guest, ptr, count)?;
        Ok(view.to_vec())
    }

    /// Read a little-endian scalar at a byte offset.
    pub fn load<T: Element>(&mut self, ptr: u32) -> BridgeResult<T> {
        let (bridge, guest) = self.parts();
        Ok(bridge.views().load::<T, _>(&guest, ptr)?)
    }

    /// Write a little-endian scalar at a byte offset.
    pub fn store<T: Element>(&mut self, ptr: u32, value: T) -> BridgeResult<()> {
        let (bridge, mut guest) = self.parts();
        Ok(bridge.views().store::<T, _>(&mut guest, ptr, value)?)
    }

    /// Run `op` at the call boundary.
    ///
    /// Recoverable failures become a pending error and `R::ABNORMAL`.
    pub fn guarded<R, F>(&mut self, op: F) -> BridgeResult<R>
    where
        R: Sentinel,
        F: FnOnce(&mut Self) -> BridgeResult<R>,
    {
        let bridge = self.bridge.clone();
        bridge.guard(|| op(self))
    }

    /// Invoke the closure behind `handle`.
    pub fn invoke_closure(
        &mut self,
        handle: Handle,
        args: &[GuestVal],
    ) -> BridgeResult<Option<Vec<GuestVal>>> {
        let (bridge, mut guest) = self.parts();
        bridge.invoke_closure(&mut guest, handle, args)
    }

    /// Release the guest's reference to the closure behind `handle`.
    pub fn closure_unref(&mut self, handle: Handle) -> BridgeResult<()> {
        let (bridge, mut guest) = self.parts();
        bridge.closure_unref(&mut guest, handle)
    }
}

/// Extension trait to convert a `Caller` into a `ShimContext`.
pub trait IntoShimContext<'a, S> {
    /// Wrap the caller in a shim context.
    fn into_shim(self) -> wasmtime::Result<ShimContext<'a, S>>;
}

impl<'a, S> IntoShimContext<'a, S> for Caller<'a, BridgeData<S>> {
    fn into_shim(self) -> wasmtime::Result<ShimContext<'a, S>> {
        ShimContext::new(self)
    }
}
