//! Typed views over guest linear memory.
//!
//! Guest memory can be replaced by a larger buffer during any call into the
//! guest. [`MemoryViews`] keeps one cache slot per element width, each slot
//! remembering the identity of the buffer it was built against. Every access
//! compares that identity with the guest's current buffer and rebuilds the
//! slot when they differ, so a view is never served from a stale buffer.

use std::fmt;
use std::marker::PhantomData;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::MemoryError;
use crate::guest::GuestMemory;

/// Identity of a guest memory buffer.
///
/// Two ids are equal only when both the base address and the byte length
/// match; any growth or replacement yields a new identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    addr: usize,
    len: usize,
}

impl BufferId {
    /// Identity of a byte slice.
    pub fn of(data: &[u8]) -> Self {
        Self {
            addr: data.as_ptr() as usize,
            len: data.len(),
        }
    }

    /// Length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Element kinds a view can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
    /// Byte-addressed, unaligned, little-endian scalar access.
    Data,
}

impl ViewKind {
    /// Every kind, in cache slot order.
    pub const ALL: [ViewKind; 9] = [
        Self::U8,
        Self::I8,
        Self::U16,
        Self::I16,
        Self::U32,
        Self::I32,
        Self::F32,
        Self::F64,
        Self::Data,
    ];

    /// Element width in bytes.
    pub const fn width(self) -> usize {
        match self {
            Self::U8 | Self::I8 | Self::Data => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    const fn slot(self) -> usize {
        self as usize
    }

    /// Lowercase name of the kind.
    pub const fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Data => "data",
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A scalar that can be read from or written to guest memory.
///
/// Guest memory is little-endian regardless of the host.
pub trait Element: sealed::Sealed + Copy + Default + fmt::Debug + 'static {
    /// The view kind used for slices of this element.
    const KIND: ViewKind;
    /// Width in bytes.
    const WIDTH: usize;

    /// Decode from exactly `WIDTH` bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// Encode into exactly `WIDTH` bytes.
    fn write_le(self, out: &mut [u8]);
}

macro_rules! impl_element {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Element for $ty {
                const KIND: ViewKind = ViewKind::$kind;
                const WIDTH: usize = std::mem::size_of::<$ty>();

                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }

                fn write_le(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_element! {
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    f32 => F32,
    f64 => F64,
}

#[derive(Debug, Default, Clone, Copy)]
struct ViewSlot {
    buffer: Option<BufferId>,
    elements: usize,
    rebuilds: u64,
}

/// Per-width cache of views into guest memory.
#[derive(Debug, Default)]
pub struct MemoryViews {
    slots: Mutex<[ViewSlot; 9]>,
}

impl MemoryViews {
    /// Create an empty cache. Every slot is built on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the slot for `kind` against the current buffer and return the
    /// number of elements it spans.
    fn refresh(&self, kind: ViewKind, current: BufferId) -> usize {
        let mut slots = self.slots.lock();
        let slot = &mut slots[kind.slot()];
        if slot.buffer != Some(current) || slot.elements == 0 {
            slot.buffer = Some(current);
            slot.elements = current.len() / kind.width();
            slot.rebuilds += 1;
            trace!(
                kind = %kind,
                bytes = current.len(),
                rebuilds = slot.rebuilds,
                "Rebuilt memory view"
            );
        }
        slot.elements
    }

    fn byte_range(
        &self,
        kind: ViewKind,
        current: BufferId,
        offset: usize,
        count: usize,
    ) -> Result<std::ops::Range<usize>, MemoryError> {
        let available = self.refresh(kind, current);
        let out_of_bounds = MemoryError::OutOfBounds {
            kind,
            offset,
            count,
            available,
        };
        let end = offset.checked_add(count).ok_or(out_of_bounds.clone())?;
        if end > available {
            return Err(out_of_bounds);
        }
        let width = kind.width();
        Ok(offset * width..end * width)
    }

    fn element_offset<T: Element>(ptr: u32) -> Result<usize, MemoryError> {
        let ptr_bytes = ptr as usize;
        if ptr_bytes % T::WIDTH != 0 {
            return Err(MemoryError::Misaligned { kind: T::KIND, ptr });
        }
        Ok(ptr_bytes / T::WIDTH)
    }

    /// A view of `count` elements starting at element `offset`.
    pub fn view<'m, T, M>(
        &self,
        memory: &'m M,
        offset: usize,
        count: usize,
    ) -> Result<TypedView<'m, T>, MemoryError>
    where
        T: Element,
        M: GuestMemory + ?Sized,
    {
        let range = self.byte_range(T::KIND, memory.buffer_id(), offset, count)?;
        Ok(TypedView::new(&memory.data()[range]))
    }

    /// A mutable view of `count` elements starting at element `offset`.
    pub fn view_mut<'m, T, M>(
        &self,
        memory: &'m mut M,
        offset: usize,
        count: usize,
    ) -> Result<TypedViewMut<'m, T>, MemoryError>
    where
        T: Element,
        M: GuestMemory + ?Sized,
    {
        let range = self.byte_range(T::KIND, memory.buffer_id(), offset, count)?;
        Ok(TypedViewMut::new(&mut memory.data_mut()[range]))
    }

    /// A view of `count` elements starting at byte pointer `ptr`.
    ///
    /// The pointer must be aligned to the element width.
    pub fn view_at<'m, T, M>(
        &self,
        memory: &'m M,
        ptr: u32,
        count: usize,
    ) -> Result<TypedView<'m, T>, MemoryError>
    where
        T: Element,
        M: GuestMemory + ?Sized,
    {
        self.view(memory, Self::element_offset::<T>(ptr)?, count)
    }

    /// A mutable view of `count` elements starting at byte pointer `ptr`.
    pub fn view_mut_at<'m, T, M>(
        &self,
        memory: &'m mut M,
        ptr: u32,
        count: usize,
    ) -> Result<TypedViewMut<'m, T>, MemoryError>
    where
        T: Element,
        M: GuestMemory + ?Sized,
    {
        self.view_mut(memory, Self::element_offset::<T>(ptr)?, count)
    }

    /// The bytes in `[ptr, ptr + len)`.
    pub fn bytes<'m, M>(&self, memory: &'m M, ptr: u32, len: u32) -> Result<&'m [u8], MemoryError>
    where
        M: GuestMemory + ?Sized,
    {
        let range = self.byte_range(ViewKind::U8, memory.buffer_id(), ptr as usize, len as usize)?;
        Ok(&memory.data()[range])
    }

    /// Copy `bytes` into guest memory at `ptr`.
    pub fn write_bytes<M>(&self, memory: &mut M, ptr: u32, bytes: &[u8]) -> Result<(), MemoryError>
    where
        M: GuestMemory + ?Sized,
    {
        let range = self.byte_range(ViewKind::U8, memory.buffer_id(), ptr as usize, bytes.len())?;
        memory.data_mut()[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Read one little-endian scalar at an arbitrary byte offset.
    pub fn load<T, M>(&self, memory: &M, byte_offset: u32) -> Result<T, MemoryError>
    where
        T: Element,
        M: GuestMemory + ?Sized,
    {
        let range = self.data_range::<T>(memory.buffer_id(), byte_offset)?;
        Ok(T::read_le(&memory.data()[range]))
    }

    /// Write one little-endian scalar at an arbitrary byte offset.
    pub fn store<T, M>(&self, memory: &mut M, byte_offset: u32, value: T) -> Result<(), MemoryError>
    where
        T: Element,
        M: GuestMemory + ?Sized,
    {
        let range = self.data_range::<T>(memory.buffer_id(), byte_offset)?;
        value.write_le(&mut memory.data_mut()[range]);
        Ok(())
    }

    fn data_range<T: Element>(
        &self,
        current: BufferId,
        byte_offset: u32,
    ) -> Result<std::ops::Range<usize>, MemoryError> {
        self.byte_range(ViewKind::Data, current, byte_offset as usize, T::WIDTH)
    }

    /// How many times the slot for `kind` has been rebuilt.
    pub fn rebuilds(&self, kind: ViewKind) -> u64 {
        self.slots.lock()[kind.slot()].rebuilds
    }

    /// Total rebuilds across all slots.
    pub fn total_rebuilds(&self) -> u64 {
        self.slots.lock().iter().map(|slot| slot.rebuilds).sum()
    }

    /// The buffer the slot for `kind` was last built against.
    pub fn current_buffer(&self, kind: ViewKind) -> Option<BufferId> {
        self.slots.lock()[kind.slot()].buffer
    }

    /// Forget every cached buffer. Rebuild counters are kept.
    pub fn invalidate_all(&self) {
        for slot in self.slots.lock().iter_mut() {
            slot.buffer = None;
            slot.elements = 0;
        }
    }
}

/// A read-only window of `T` elements over guest memory.
#[derive(Debug, Clone, Copy)]
pub struct TypedView<'m, T> {
    bytes: &'m [u8],
    _element: PhantomData<T>,
}

impl<'m, T: Element> TypedView<'m, T> {
    fn new(bytes: &'m [u8]) -> Self {
        Self {
            bytes,
            _element: PhantomData,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.bytes.len() / T::WIDTH
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The element at `index`.
    pub fn get(&self, index: usize) -> Option<T> {
        let start = index.checked_mul(T::WIDTH)?;
        let bytes = self.bytes.get(start..start + T::WIDTH)?;
        Some(T::read_le(bytes))
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + 'm {
        self.bytes.chunks_exact(T::WIDTH).map(T::read_le)
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }

    /// The raw bytes under the view.
    pub fn as_bytes(&self) -> &'m [u8] {
        self.bytes
    }
}

/// A writable window of `T` elements over guest memory.
#[derive(Debug)]
pub struct TypedViewMut<'m, T> {
    bytes: &'m mut [u8],
    _element: PhantomData<T>,
}

impl<'m, T: Element> TypedViewMut<'m, T> {
    fn new(bytes: &'m mut [u8]) -> Self {
        Self {
            bytes,
            _element: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / T::WIDTH
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<T> {
        let start = index.checked_mul(T::WIDTH)?;
        let bytes = self.bytes.get(start..start + T::WIDTH)?;
        Some(T::read_le(bytes))
    }

    /// Overwrite the element at `index`.
    pub fn set(&mut self, index: usize, value: T) -> Result<(), MemoryError> {
        let available = self.len();
        if index >= available {
            return Err(MemoryError::OutOfBounds {
                kind: T::KIND,
                offset: index,
                count: 1,
                available,
            });
        }
        let start = index * T::WIDTH;
        value.write_le(&mut self.bytes[start..start + T::WIDTH]);
        Ok(())
    }

    /// Overwrite the view with `values`, which must have the same length.
    pub fn copy_from(&mut self, values: &[T]) -> Result<(), MemoryError> {
        let available = self.len();
        if values.len() != available {
            return Err(MemoryError::OutOfBounds {
                kind: T::KIND,
                offset: 0,
                count: values.len(),
                available,
            });
        }
        for (chunk, value) in self.bytes.chunks_exact_mut(T::WIDTH).zip(values) {
            value.write_le(chunk);
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.bytes.chunks_exact(T::WIDTH).map(T::read_le).collect()
    }
}
