//! An in-process guest for exercising the bridge without a wasm engine.
//!
//! [`SimulatedGuest`] couples a [`LinearMemory`] with a bump allocator and a
//! table of programmable trampolines. Growing the memory replaces its
//! backing buffer, the same way a real engine may move memory, so cached
//! views are forced through their rebuild path.

use std::collections::HashMap;
use std::sync::Arc;

use crate::abi::GuestVal;
use crate::error::{BridgeError, BridgeResult, ResourceExhausted};
use crate::guest::{GuestAllocator, GuestMemory, GuestTrampolines};

/// A growable, page-granular byte buffer.
#[derive(Debug, Clone)]
pub struct LinearMemory {
    bytes: Vec<u8>,
    max_pages: usize,
}

impl LinearMemory {
    /// Size of one page in bytes.
    pub const PAGE_SIZE: usize = 65_536;

    /// Create a memory of `pages` zeroed pages.
    pub fn new(pages: usize) -> Self {
        Self {
            bytes: vec![0; pages * Self::PAGE_SIZE],
            max_pages: 65_536,
        }
    }

    /// Limit growth to `max_pages`.
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Current size in pages.
    pub fn pages(&self) -> usize {
        self.bytes.len() / Self::PAGE_SIZE
    }

    /// Grow by `delta` pages, moving the contents into a new buffer.
    /// Returns the previous size in pages.
    pub fn grow(&mut self, delta: usize) -> Result<usize, ResourceExhausted> {
        let previous = self.pages();
        let pages = previous + delta;
        if pages > self.max_pages {
            return Err(ResourceExhausted::Memory {
                requested: pages * Self::PAGE_SIZE,
                limit: self.max_pages * Self::PAGE_SIZE,
            });
        }
        let mut bytes = vec![0; pages * Self::PAGE_SIZE];
        bytes[..self.bytes.len()].copy_from_slice(&self.bytes);
        self.bytes = bytes;
        Ok(previous)
    }
}

impl GuestMemory for LinearMemory {
    fn data(&self) -> &[u8] {
        &self.bytes
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// A trampoline body: `(guest, data, dispatch, args) -> results`.
pub type Trampoline =
    Arc<dyn Fn(&mut SimulatedGuest, u32, u32, &[GuestVal]) -> BridgeResult<Vec<GuestVal>> + Send + Sync>;

/// One call made to the simulated allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocCall {
    Malloc { size: u32, align: u32 },
    Realloc { ptr: u32, old_size: u32, new_size: u32 },
    Free { ptr: u32, size: u32 },
}

/// A guest simulated in host memory.
pub struct SimulatedGuest {
    memory: LinearMemory,
    next: u32,
    realloc: bool,
    trampolines: HashMap<u32, Trampoline>,
    alloc_calls: Vec<AllocCall>,
    destroyed: Vec<(u32, u32, u32)>,
}

impl SimulatedGuest {
    /// First address handed out by the allocator.
    pub const HEAP_BASE: u32 = 1024;

    /// A guest with one page of memory.
    pub fn new() -> Self {
        Self::with_memory(LinearMemory::new(1))
    }

    pub fn with_memory(memory: LinearMemory) -> Self {
        Self {
            memory,
            next: Self::HEAP_BASE,
            realloc: true,
            trampolines: HashMap::new(),
            alloc_calls: Vec::new(),
            destroyed: Vec::new(),
        }
    }

    /// Report that the allocator has no `realloc`.
    pub fn without_realloc(mut self) -> Self {
        self.realloc = false;
        self
    }

    /// Install the trampoline at function table index `index`.
    pub fn set_trampoline<F>(&mut self, index: u32, body: F)
    where
        F: Fn(&mut SimulatedGuest, u32, u32, &[GuestVal]) -> BridgeResult<Vec<GuestVal>>
            + Send
            + Sync
            + 'static,
    {
        self.trampolines.insert(index, Arc::new(body));
    }

    pub fn memory(&self) -> &LinearMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut LinearMemory {
        &mut self.memory
    }

    /// Allocator calls made so far.
    pub fn alloc_calls(&self) -> &[AllocCall] {
        &self.alloc_calls
    }

    /// Destroy trampoline calls made so far, as `(index, data, dispatch)`.
    pub fn destroyed(&self) -> &[(u32, u32, u32)] {
        &self.destroyed
    }

    fn bump(&mut self, size: u32, align: u32) -> BridgeResult<u32> {
        let align = align.max(1);
        let ptr = self.next.div_ceil(align) * align;
        let end = ptr as usize + size as usize;
        let available = self.memory.data().len();
        if end > available {
            let needed = (end - available).div_ceil(LinearMemory::PAGE_SIZE);
            self.memory.grow(needed)?;
        }
        self.next = end as u32;
        Ok(ptr)
    }
}

impl Default for SimulatedGuest {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimulatedGuest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedGuest")
            .field("pages", &self.memory.pages())
            .field("next", &self.next)
            .field("trampolines", &self.trampolines.len())
            .finish()
    }
}

impl GuestMemory for SimulatedGuest {
    fn data(&self) -> &[u8] {
        self.memory.data()
    }

    fn data_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut()
    }
}

impl GuestAllocator for SimulatedGuest {
    fn malloc(&mut self, size: u32, align: u32) -> BridgeResult<u32> {
        self.alloc_calls.push(AllocCall::Malloc { size, align });
        self.bump(size, align)
    }

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> BridgeResult<u32> {
        self.alloc_calls.push(AllocCall::Realloc {
            ptr,
            old_size,
            new_size,
        });
        if new_size <= old_size {
            return Ok(ptr);
        }
        let moved = self.bump(new_size, align)?;
        let (src, dst) = (ptr as usize, moved as usize);
        self.memory
            .data_mut()
            .copy_within(src..src + old_size as usize, dst);
        Ok(moved)
    }

    fn free(&mut self, ptr: u32, size: u32, _align: u32) -> BridgeResult<()> {
        self.alloc_calls.push(AllocCall::Free { ptr, size });
        Ok(())
    }

    fn supports_realloc(&self) -> bool {
        self.realloc
    }
}

impl GuestTrampolines for SimulatedGuest {
    fn invoke_closure(
        &mut self,
        invoke: u32,
        data: u32,
        dispatch: u32,
        args: &[GuestVal],
    ) -> BridgeResult<Vec<GuestVal>> {
        let body = self.trampolines.get(&invoke).cloned().ok_or_else(|| {
            BridgeError::guest("invoke_closure", format!("no trampoline at index {invoke}"))
        })?;
        body(self, data, dispatch, args)
    }

    fn destroy_closure(&mut self, destroy: u32, data: u32, dispatch: u32) -> BridgeResult<()> {
        self.destroyed.push((destroy, data, dispatch));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_replaces_buffer() {
        let mut memory = LinearMemory::new(1);
        memory.data_mut()[10] = 42;
        let before = memory.buffer_id();

        assert_eq!(memory.grow(2).unwrap(), 1);
        assert_ne!(memory.buffer_id(), before);
        assert_eq!(memory.pages(), 3);
        assert_eq!(memory.data()[10], 42);
    }

    #[test]
    fn test_growth_limit() {
        let mut memory = LinearMemory::new(1).with_max_pages(2);
        memory.grow(1).unwrap();
        assert!(matches!(
            memory.grow(1),
            Err(ResourceExhausted::Memory { .. })
        ));
    }

    #[test]
    fn test_realloc_copies_contents() {
        let mut guest = SimulatedGuest::new();
        let ptr = guest.malloc(3, 1).unwrap();
        guest.data_mut()[ptr as usize..ptr as usize + 3].copy_from_slice(b"abc");

        let moved = guest.realloc(ptr, 3, 100_000, 1).unwrap();
        assert_ne!(moved, ptr);
        assert_eq!(&guest.data()[moved as usize..moved as usize + 3], b"abc");
    }
}
