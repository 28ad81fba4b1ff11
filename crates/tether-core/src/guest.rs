//! The seams between the bridge and a guest runtime.
//!
//! The bridge never talks to an engine directly. It reads and writes the
//! guest's linear memory through [`GuestMemory`], asks the guest for storage
//! through [`GuestAllocator`], and enters guest closures through
//! [`GuestTrampolines`]. `tether-host` implements all three over wasmtime;
//! tests use an in-process simulation.

use crate::abi::GuestVal;
use crate::error::BridgeResult;
use crate::memory::BufferId;

/// Access to the guest's current linear memory buffer.
///
/// The buffer may move or grow during any guest call. Slices returned here
/// must not be held across calls into the guest.
pub trait GuestMemory {
    /// The current buffer.
    fn data(&self) -> &[u8];

    /// The current buffer, mutably.
    fn data_mut(&mut self) -> &mut [u8];

    /// Identity of the current buffer.
    fn buffer_id(&self) -> BufferId {
        BufferId::of(self.data())
    }
}

/// The guest's allocator.
///
/// Pointers are byte offsets into guest memory. Every call may grow memory.
pub trait GuestAllocator {
    /// Allocate `size` bytes aligned to `align`.
    fn malloc(&mut self, size: u32, align: u32) -> BridgeResult<u32>;

    /// Resize an allocation, returning its possibly moved pointer.
    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32)
    -> BridgeResult<u32>;

    /// Release an allocation.
    fn free(&mut self, ptr: u32, size: u32, align: u32) -> BridgeResult<()>;

    /// Whether [`realloc`](Self::realloc) is available.
    fn supports_realloc(&self) -> bool {
        true
    }
}

/// Entry into guest closure code through its function table.
pub trait GuestTrampolines {
    /// Call the invoke trampoline at table index `invoke`.
    fn invoke_closure(
        &mut self,
        invoke: u32,
        data: u32,
        dispatch: u32,
        args: &[GuestVal],
    ) -> BridgeResult<Vec<GuestVal>>;

    /// Call the destroy trampoline at table index `destroy`.
    fn destroy_closure(&mut self, destroy: u32, data: u32, dispatch: u32) -> BridgeResult<()>;
}

/// A complete guest: memory, allocator and trampolines.
pub trait Guest: GuestMemory + GuestAllocator + GuestTrampolines {}

impl<T: GuestMemory + GuestAllocator + GuestTrampolines> Guest for T {}
