//! Tether Core - Guest/Host Interop Kernel
//!
//! This crate holds the engine-agnostic half of the Tether bridge. A guest
//! (typically a WebAssembly module) can only hold integers and byte offsets;
//! this crate gives those integers meaning on the host side:
//!
//! - [`HandleTable`]: host values addressed by 32-bit [`Handle`]s
//! - [`MemoryViews`]: typed views over guest memory that survive growth
//! - [`strings`]: UTF-8 marshaling through the guest allocator
//! - [`HostClosure`]: reference-counted wrappers around guest closures
//! - [`PendingError`]: the single-slot error register behind [`Bridge::guard`]
//! - [`Bridge`]: all of the above behind one cloneable value
//!
//! The guest itself is reached only through the traits in [`guest`], so the
//! kernel can be driven by wasmtime (see `tether-host`) or by the in-process
//! [`testing::SimulatedGuest`].
//!
//! # Quick Start
//!
//! ```ignore
//! use tether_core::prelude::*;
//!
//! let bridge = Bridge::new(BridgeConfig::default());
//!
//! let handle = bridge.alloc("hello")?;
//! assert_eq!(handle, Handle::new(4));
//!
//! let slice = bridge.encode_string(&mut guest, "日本語")?;
//! let text = bridge.decode_string(&guest, slice.ptr, slice.len)?;
//! ```
//!
//! # Error Model
//!
//! Host failures, undecodable text and exhausted resources are recoverable:
//! [`Bridge::guard`] parks them in the pending-error slot and returns an
//! abnormal sentinel for the guest to check. Everything else is a defect and
//! is returned as an error, which the host adapter turns into a trap.

pub mod abi;
pub mod bridge;
pub mod closure;
pub mod config;
pub mod error;
pub mod guest;
pub mod handles;
pub mod memory;
pub mod pending;
pub mod strings;
pub mod value;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export main types at crate root
pub use abi::{GuestVal, Sentinel};
pub use bridge::{Bridge, BridgeStats, TeardownSummary};
pub use closure::{ClosureRegistry, ClosureSpec, HostClosure};
pub use config::{BridgeConfig, FreePolicy, HandleTableConfig, StringConfig};
pub use error::{
    BridgeError, BridgeResult, ClosureError, DecodeError, ErrorSlotViolation, HandleError,
    MemoryError, ResourceExhausted,
};
pub use guest::{Guest, GuestAllocator, GuestMemory, GuestTrampolines};
pub use handles::{Handle, HandleTable};
pub use memory::{BufferId, Element, MemoryViews, TypedView, TypedViewMut, ViewKind};
pub use pending::PendingError;
pub use strings::{GuestSlice, Utf8Decoder};
pub use value::{HostException, HostObject, HostValue};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::abi::{GuestVal, Sentinel};
    pub use crate::bridge::{Bridge, BridgeStats};
    pub use crate::closure::{ClosureSpec, HostClosure};
    pub use crate::config::{BridgeConfig, FreePolicy};
    pub use crate::error::{BridgeError, BridgeResult};
    pub use crate::guest::{Guest, GuestAllocator, GuestMemory, GuestTrampolines};
    pub use crate::handles::Handle;
    pub use crate::memory::{MemoryViews, ViewKind};
    pub use crate::strings::GuestSlice;
    pub use crate::value::{HostException, HostObject, HostValue};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use super::testing::SimulatedGuest;

    #[test]
    fn test_end_to_end() {
        let bridge = Bridge::new(BridgeConfig::strict());
        let mut guest = SimulatedGuest::new();

        // A host function returning a string to the guest.
        let handle = bridge.alloc("abc€def").unwrap();
        let text = bridge.get(handle).unwrap();
        let slice = bridge
            .encode_string(&mut guest, text.as_str().unwrap())
            .unwrap();
        assert_eq!(slice.len, 9);

        // The guest writes a return slot through the data view.
        let ret = 512;
        bridge.views().store(&mut guest, ret, slice.ptr).unwrap();
        bridge.views().store(&mut guest, ret + 4, slice.len).unwrap();

        let ptr: u32 = bridge.views().load(&guest, ret).unwrap();
        let len: u32 = bridge.views().load(&guest, ret + 4).unwrap();
        assert_eq!(bridge.decode_string(&guest, ptr, len).unwrap(), "abc€def");

        bridge.free(handle).unwrap();
        let summary = bridge.teardown(&mut guest).unwrap();
        assert_eq!(summary.handles_released, 0);
    }
}
