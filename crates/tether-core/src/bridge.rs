//! The bridge: one handle table, view cache, decoder, closure registry and
//! pending-error slot, shared by every host function of an instance.
//!
//! Each component sits behind its own lock and no lock is held while the
//! guest runs, so a closure trampoline may call back into the bridge.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::abi::{GuestVal, Sentinel};
use crate::closure::{ClosureRegistry, ClosureSpec, HostClosure};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult, HandleError};
use crate::guest::{GuestAllocator, GuestMemory, GuestTrampolines};
use crate::handles::{Handle, HandleTable};
use crate::memory::MemoryViews;
use crate::pending::PendingError;
use crate::strings::{self, GuestSlice, Utf8Decoder};
use crate::value::{HostException, HostValue};

/// Point-in-time counters describing a bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    /// Live dynamic handles.
    pub live_handles: usize,
    /// Handle table capacity, including sentinels.
    pub handle_capacity: u32,
    /// View rebuilds across all element widths.
    pub view_rebuilds: u64,
    /// Bytes of guest text decoded.
    pub bytes_decoded: u64,
    /// Decoder instances created.
    pub decoder_instances: u64,
    /// Closures not yet destroyed.
    pub live_closures: usize,
    /// Closures dropped by the host and awaiting reclamation.
    pub pending_reclamations: usize,
    /// Whether an undrained error is pending.
    pub error_pending: bool,
}

/// What [`Bridge::teardown`] released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TeardownSummary {
    /// Handles dropped from the table.
    pub handles_released: usize,
    /// Closures destroyed by reclamation.
    pub closures_reclaimed: usize,
}

struct BridgeInner {
    config: BridgeConfig,
    handles: Mutex<HandleTable>,
    views: MemoryViews,
    decoder: Mutex<Utf8Decoder>,
    closures: Arc<ClosureRegistry>,
    pending: Mutex<PendingError>,
}

/// Shared bridge state. Clones refer to the same state.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// Create a bridge.
    pub fn new(config: BridgeConfig) -> Self {
        debug!(
            max_handles = config.handles.max_handles,
            free_policy = ?config.handles.free_policy,
            "Creating bridge"
        );
        Self {
            inner: Arc::new(BridgeInner {
                handles: Mutex::new(HandleTable::new(config.handles.clone())),
                views: MemoryViews::new(),
                decoder: Mutex::new(Utf8Decoder::new(config.strings.decoder_byte_ceiling)),
                closures: ClosureRegistry::new(),
                pending: Mutex::new(PendingError::new()),
                config,
            }),
        }
    }

    /// The configuration this bridge was created with.
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Store a host value and return its handle.
    pub fn alloc(&self, value: impl Into<HostValue>) -> BridgeResult<Handle> {
        Ok(self.inner.handles.lock().alloc(value.into())?)
    }

    /// A clone of the value behind `handle`.
    pub fn get(&self, handle: Handle) -> BridgeResult<HostValue> {
        Ok(self.inner.handles.lock().get(handle)?.clone())
    }

    /// Run `f` on the value behind `handle` without cloning it.
    ///
    /// The table is locked while `f` runs; `f` must not call back into the
    /// bridge.
    pub fn with_value<R>(&self, handle: Handle, f: impl FnOnce(&HostValue) -> R) -> BridgeResult<R> {
        let table = self.inner.handles.lock();
        Ok(f(table.get(handle)?))
    }

    /// Release a handle.
    pub fn free(&self, handle: Handle) -> BridgeResult<()> {
        Ok(self.inner.handles.lock().free(handle)?)
    }

    /// Take the value behind `handle` and release the handle.
    pub fn take(&self, handle: Handle) -> BridgeResult<HostValue> {
        Ok(self.inner.handles.lock().take(handle)?)
    }

    /// Allocate a second handle to the same value.
    pub fn duplicate(&self, handle: Handle) -> BridgeResult<Handle> {
        self.inner.handles.lock().duplicate(handle)
    }

    /// Number of live dynamic handles.
    pub fn live_handles(&self) -> usize {
        self.inner.handles.lock().live_count()
    }

    /// The memory view cache.
    pub fn views(&self) -> &MemoryViews {
        &self.inner.views
    }

    /// Copy `text` into a new guest allocation.
    pub fn encode_string<G>(&self, guest: &mut G, text: &str) -> BridgeResult<GuestSlice>
    where
        G: GuestAllocator + GuestMemory + ?Sized,
    {
        strings::encode(guest, &self.inner.views, text)
    }

    /// Decode `[ptr, ptr + len)` of guest memory as UTF-8.
    pub fn decode_string<M>(&self, memory: &M, ptr: u32, len: u32) -> BridgeResult<String>
    where
        M: GuestMemory + ?Sized,
    {
        let mut decoder = self.inner.decoder.lock();
        strings::decode(memory, &self.inner.views, &mut decoder, ptr, len)
    }

    /// Decode a guest string and store it as a host value.
    pub fn alloc_string<M>(&self, memory: &M, ptr: u32, len: u32) -> BridgeResult<Handle>
    where
        M: GuestMemory + ?Sized,
    {
        let text = self.decode_string(memory, ptr, len)?;
        self.alloc(text)
    }

    /// Wrap a guest closure without giving it a handle.
    pub fn wrap_closure(&self, spec: ClosureSpec) -> HostClosure {
        self.inner.closures.wrap(spec)
    }

    /// Wrap a guest closure and return a handle to it.
    pub fn closure_new(&self, spec: ClosureSpec) -> BridgeResult<Handle> {
        let closure = self.wrap_closure(spec);
        debug!(id = closure.id(), data = spec.data, "Wrapped guest closure");
        self.alloc(closure)
    }

    /// The closure behind `handle`.
    pub fn closure(&self, handle: Handle) -> BridgeResult<HostClosure> {
        self.with_value(handle, |value| match value {
            HostValue::Function(closure) => Ok(closure.clone()),
            other => Err(HandleError::UnexpectedKind {
                handle,
                expected: "function",
                found: other.kind(),
            }),
        })?
        .map_err(BridgeError::from)
    }

    /// Invoke the closure behind `handle`.
    pub fn invoke_closure<G>(
        &self,
        guest: &mut G,
        handle: Handle,
        args: &[GuestVal],
    ) -> BridgeResult<Option<Vec<GuestVal>>>
    where
        G: GuestTrampolines + ?Sized,
    {
        self.closure(handle)?.invoke(guest, args)
    }

    /// Release the guest's reference to the closure behind `handle`.
    pub fn closure_unref<G>(&self, guest: &mut G, handle: Handle) -> BridgeResult<()>
    where
        G: GuestTrampolines + ?Sized,
    {
        self.closure(handle)?.unref(guest)
    }

    /// Destroy closures the host has dropped without the guest releasing
    /// them. Returns the number destroyed.
    pub fn reclaim_closures<G>(&self, guest: &mut G) -> BridgeResult<usize>
    where
        G: GuestTrampolines + ?Sized,
    {
        self.inner.closures.drain(guest)
    }

    /// Run a host operation at the call boundary.
    ///
    /// A recoverable failure is parked in the pending-error slot and the
    /// guest receives `R::ABNORMAL`. Defects are returned unchanged.
    pub fn guard<R, F>(&self, op: F) -> BridgeResult<R>
    where
        R: Sentinel,
        F: FnOnce() -> BridgeResult<R>,
    {
        match op() {
            Ok(value) => Ok(value),
            Err(err) if err.is_recoverable() => {
                self.raise(err)?;
                Ok(R::ABNORMAL)
            }
            Err(err) => Err(err),
        }
    }

    /// Park an error in the pending-error slot and return its handle.
    ///
    /// If an earlier error is still pending the new error handle is released
    /// and the violation is returned.
    pub fn raise(&self, err: BridgeError) -> BridgeResult<Handle> {
        let handle = self.alloc(HostValue::Error(err.into_exception()))?;
        let stored = self.inner.pending.lock().store(handle);
        if let Err(violation) = stored {
            self.free(handle)?;
            return Err(violation.into());
        }
        Ok(handle)
    }

    /// Drain the pending-error slot.
    pub fn take_pending_error(&self) -> Option<Handle> {
        self.inner.pending.lock().take()
    }

    /// Drain the pending-error slot and release its handle.
    pub fn take_pending_exception(&self) -> BridgeResult<Option<HostException>> {
        let Some(handle) = self.take_pending_error() else {
            return Ok(None);
        };
        match self.take(handle)? {
            HostValue::Error(exception) => Ok(Some(exception)),
            other => Ok(Some(HostException::msg(other.debug_string()))),
        }
    }

    pub fn has_pending_error(&self) -> bool {
        self.inner.pending.lock().is_set()
    }

    /// Current counters.
    pub fn stats(&self) -> BridgeStats {
        let (live_handles, handle_capacity) = {
            let table = self.inner.handles.lock();
            (table.live_count(), table.capacity())
        };
        let (bytes_decoded, decoder_instances) = {
            let decoder = self.inner.decoder.lock();
            (decoder.total_bytes(), decoder.instances())
        };

        BridgeStats {
            live_handles,
            handle_capacity,
            view_rebuilds: self.inner.views.total_rebuilds(),
            bytes_decoded,
            decoder_instances,
            live_closures: self.inner.closures.live_count(),
            pending_reclamations: self.inner.closures.pending_count(),
            error_pending: self.has_pending_error(),
        }
    }

    /// Drop every host value, destroy closures left behind and forget all
    /// cached views.
    pub fn teardown<G>(&self, guest: &mut G) -> BridgeResult<TeardownSummary>
    where
        G: GuestTrampolines + ?Sized,
    {
        self.inner.pending.lock().take();
        let handles_released = self.inner.handles.lock().reset();
        let closures_reclaimed = self.reclaim_closures(guest)?;
        self.inner.views.invalidate_all();

        info!(handles_released, closures_reclaimed, "Bridge torn down");
        Ok(TeardownSummary {
            handles_released,
            closures_reclaimed,
        })
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge").field("stats", &self.stats()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FreePolicy;
    use crate::error::{DecodeError, ErrorSlotViolation, ResourceExhausted};
    use crate::testing::SimulatedGuest;

    fn bridge() -> Bridge {
        Bridge::new(BridgeConfig::strict())
    }

    #[test]
    fn test_hello_handle_scenario() {
        let bridge = bridge();

        let handle = bridge.alloc("hello").unwrap();
        assert_eq!(handle, Handle::new(4));
        assert_eq!(bridge.get(handle).unwrap().as_str(), Some("hello"));

        bridge.free(handle).unwrap();
        assert_eq!(bridge.alloc(2.0).unwrap(), Handle::new(4));
    }

    #[test]
    fn test_string_round_trip_through_bridge() {
        let bridge = bridge();
        let mut guest = SimulatedGuest::new();

        let slice = bridge.encode_string(&mut guest, "日本語").unwrap();
        assert_eq!(slice.len, 9);

        let handle = bridge.alloc_string(&guest, slice.ptr, slice.len).unwrap();
        assert_eq!(bridge.get(handle).unwrap().as_str(), Some("日本語"));
        assert_eq!(bridge.stats().bytes_decoded, 9);
    }

    #[test]
    fn test_guard_success_passes_through() {
        let bridge = bridge();
        let value = bridge.guard(|| Ok(41 + 1)).unwrap();
        assert_eq!(value, 42);
        assert!(!bridge.has_pending_error());
    }

    #[test]
    fn test_guard_parks_recoverable_error() {
        let bridge = bridge();

        let value: f64 = bridge
            .guard(|| Err(BridgeError::host(anyhow::anyhow!("context lost"))))
            .unwrap();
        assert!(value.is_nan());
        assert!(bridge.has_pending_error());

        let exception = bridge.take_pending_exception().unwrap().unwrap();
        assert_eq!(exception.message(), "context lost");
        assert!(!bridge.has_pending_error());
        assert_eq!(bridge.live_handles(), 0);
    }

    #[test]
    fn test_guard_decode_error_returns_undefined_handle() {
        let bridge = bridge();
        let mut guest = SimulatedGuest::new();
        guest.data_mut()[100] = 0xff;

        let handle = bridge
            .guard(|| bridge.alloc_string(&guest, 100, 1))
            .unwrap();
        assert_eq!(handle, Handle::UNDEFINED);

        let pending = bridge.take_pending_error().unwrap();
        let message = bridge.get(pending).unwrap().as_error().unwrap().message();
        assert!(message.contains(&DecodeError::InvalidUtf8 { valid_up_to: 0, error_len: Some(1) }.to_string()));
    }

    #[test]
    fn test_guard_defect_is_not_parked() {
        let bridge = bridge();
        let stale = Handle::new(40);

        let err = bridge.guard(|| bridge.get(stale).map(|_| ())).unwrap_err();
        assert!(matches!(err, BridgeError::Handle(HandleError::OutOfRange { .. })));
        assert!(!bridge.has_pending_error());
    }

    #[test]
    fn test_undrained_error_is_detected() {
        let bridge = bridge();
        let fail = || -> BridgeResult<i32> {
            Err(ResourceExhausted::HandleTable { limit: 1 }.into())
        };

        bridge.guard(fail).unwrap();
        let first = bridge.inner.pending.lock().peek().unwrap();
        let live = bridge.live_handles();

        let err = bridge.guard(fail).unwrap_err();
        match err {
            BridgeError::ErrorSlot(ErrorSlotViolation { pending, .. }) => assert_eq!(pending, first),
            other => panic!("unexpected error: {other}"),
        }
        // The second error's handle was released.
        assert_eq!(bridge.live_handles(), live);
        assert_eq!(bridge.take_pending_error(), Some(first));
    }

    #[test]
    fn test_closure_lifecycle_through_handles() {
        let bridge = bridge();
        let mut guest = SimulatedGuest::new();
        guest.set_trampoline(1, |_, data, _, _| Ok(vec![GuestVal::I32(data as i32)]));

        let handle = bridge
            .closure_new(ClosureSpec {
                data: 64,
                dispatch: 0,
                destroy: 2,
                invoke: 1,
            })
            .unwrap();
        assert!(bridge.get(handle).unwrap().is_function());

        let out = bridge.invoke_closure(&mut guest, handle, &[]).unwrap();
        assert_eq!(out, Some(vec![GuestVal::I32(64)]));

        bridge.closure_unref(&mut guest, handle).unwrap();
        assert_eq!(guest.destroyed(), &[(2, 64, 0)]);
        assert_eq!(bridge.invoke_closure(&mut guest, handle, &[]).unwrap(), None);

        bridge.free(handle).unwrap();
        assert_eq!(bridge.reclaim_closures(&mut guest).unwrap(), 0);
    }

    #[test]
    fn test_closure_kind_mismatch() {
        let bridge = bridge();
        let handle = bridge.alloc(1.0).unwrap();
        let err = bridge.closure(handle).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Handle(HandleError::UnexpectedKind { expected: "function", found: "number", .. })
        ));
    }

    #[test]
    fn test_freed_closure_handle_is_reclaimed() {
        let bridge = bridge();
        let mut guest = SimulatedGuest::new();

        let handle = bridge
            .closure_new(ClosureSpec {
                data: 8,
                dispatch: 3,
                destroy: 9,
                invoke: 1,
            })
            .unwrap();
        bridge.free(handle).unwrap();
        assert_eq!(bridge.stats().pending_reclamations, 1);

        assert_eq!(bridge.reclaim_closures(&mut guest).unwrap(), 1);
        assert_eq!(guest.destroyed(), &[(9, 8, 3)]);
        assert_eq!(bridge.stats().live_closures, 0);
    }

    #[test]
    fn test_teardown() {
        let bridge = Bridge::new(BridgeConfig::default().with_free_policy(FreePolicy::Permissive));
        let mut guest = SimulatedGuest::new();

        bridge.alloc("a").unwrap();
        bridge
            .closure_new(ClosureSpec {
                data: 1,
                dispatch: 0,
                destroy: 5,
                invoke: 1,
            })
            .unwrap();
        bridge.raise(BridgeError::host(anyhow::anyhow!("late"))).unwrap();

        let summary = bridge.teardown(&mut guest).unwrap();
        assert_eq!(summary.handles_released, 3);
        assert_eq!(summary.closures_reclaimed, 1);

        let stats = bridge.stats();
        assert_eq!(stats.live_handles, 0);
        assert!(!stats.error_pending);
        assert_eq!(stats.live_closures, 0);
    }

    #[test]
    fn test_stats_serialize() {
        let bridge = bridge();
        bridge.alloc("x").unwrap();
        let json = serde_json::to_value(bridge.stats()).unwrap();
        assert_eq!(json["live_handles"], 1);
        assert_eq!(json["error_pending"], false);
    }
}
