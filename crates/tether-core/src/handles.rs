//! The handle table.
//!
//! Host values never cross into the guest. The guest holds a [`Handle`], a
//! 32-bit index into this table, and the table keeps the value alive until
//! the guest frees it. Indices 0 through 3 are permanently bound to
//! `undefined`, `null`, `true` and `false` so the commonest values never
//! touch the allocator.
//!
//! Freed slots form an intrusive singly linked free list; the most recently
//! freed slot is reused first.

use std::fmt;

use tracing::{debug, warn};

use crate::config::{FreePolicy, HandleTableConfig};
use crate::error::{BridgeResult, HandleError, ResourceExhausted};
use crate::value::HostValue;

/// Guest-visible name of a host value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// Handle of `undefined`.
    pub const UNDEFINED: Self = Self(0);
    /// Handle of `null`.
    pub const NULL: Self = Self(1);
    /// Handle of `true`.
    pub const TRUE: Self = Self(2);
    /// Handle of `false`.
    pub const FALSE: Self = Self(3);

    /// Number of reserved sentinel slots.
    pub const RESERVED: u32 = 4;

    /// Create a handle from its raw index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// The raw table index.
    pub const fn index(self) -> u32 {
        self.0
    }

    /// Whether this is one of the four fixed handles.
    pub const fn is_sentinel(self) -> bool {
        self.0 < Self::RESERVED
    }

    /// The sentinel handle of a boolean.
    pub const fn from_bool(value: bool) -> Self {
        if value { Self::TRUE } else { Self::FALSE }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for Handle {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<i32> for Handle {
    fn from(raw: i32) -> Self {
        Self(raw as u32)
    }
}

impl From<Handle> for u32 {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

impl From<Handle> for i32 {
    fn from(handle: Handle) -> Self {
        handle.0 as i32
    }
}

#[derive(Debug)]
enum Slot {
    Occupied(HostValue),
    Vacant { next_free: Option<u32> },
}

/// Table of host values addressed by [`Handle`].
#[derive(Debug)]
pub struct HandleTable {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    capacity: u32,
    live: usize,
    config: HandleTableConfig,
}

impl HandleTable {
    /// Create a table holding only the four sentinels.
    pub fn new(config: HandleTableConfig) -> Self {
        let capacity = config
            .initial_capacity
            .clamp(Handle::RESERVED, config.max_handles.max(Handle::RESERVED));
        let mut slots = Vec::with_capacity(capacity as usize);
        Self::push_sentinels(&mut slots);

        Self {
            slots,
            free_head: None,
            capacity,
            live: 0,
            config,
        }
    }

    fn push_sentinels(slots: &mut Vec<Slot>) {
        slots.push(Slot::Occupied(HostValue::Undefined));
        slots.push(Slot::Occupied(HostValue::Null));
        slots.push(Slot::Occupied(HostValue::Bool(true)));
        slots.push(Slot::Occupied(HostValue::Bool(false)));
    }

    /// Store a value and return its handle.
    ///
    /// `undefined`, `null` and booleans return their fixed handles without
    /// allocating.
    pub fn alloc(&mut self, value: HostValue) -> Result<Handle, ResourceExhausted> {
        if let Some(handle) = value.sentinel_handle() {
            return Ok(handle);
        }

        if let Some(index) = self.free_head {
            let next_free = match self.slots[index as usize] {
                Slot::Vacant { next_free } => next_free,
                Slot::Occupied(_) => unreachable!("free list points at an occupied slot"),
            };
            self.free_head = next_free;
            self.slots[index as usize] = Slot::Occupied(value);
            self.live += 1;
            return Ok(Handle(index));
        }

        let index = self.slots.len() as u32;
        if index >= self.capacity {
            self.grow()?;
        }
        self.slots.push(Slot::Occupied(value));
        self.live += 1;
        Ok(Handle(index))
    }

    fn grow(&mut self) -> Result<(), ResourceExhausted> {
        let limit = self.config.max_handles;
        if self.capacity >= limit {
            return Err(ResourceExhausted::HandleTable { limit });
        }

        let new_capacity = self.capacity.saturating_mul(2).min(limit);
        self.slots
            .reserve((new_capacity as usize).saturating_sub(self.slots.len()));
        debug!(
            from = self.capacity,
            to = new_capacity,
            live = self.live,
            "Grew handle table"
        );
        self.capacity = new_capacity;
        Ok(())
    }

    /// Look up a value.
    pub fn get(&self, handle: Handle) -> Result<&HostValue, HandleError> {
        match self.slots.get(handle.0 as usize) {
            Some(Slot::Occupied(value)) => Ok(value),
            Some(Slot::Vacant { .. }) => Err(HandleError::Stale { handle }),
            None => Err(HandleError::OutOfRange {
                handle,
                len: self.slots.len(),
            }),
        }
    }

    /// Release a handle, making its slot available for reuse.
    ///
    /// Freeing a sentinel does nothing.
    pub fn free(&mut self, handle: Handle) -> Result<(), HandleError> {
        self.release(handle).map(drop)
    }

    /// Look up a value and release its handle.
    pub fn take(&mut self, handle: Handle) -> Result<HostValue, HandleError> {
        if handle.is_sentinel() {
            return self.get(handle).cloned();
        }
        match self.release(handle)? {
            Some(value) => Ok(value),
            // Double free tolerated by the permissive policy.
            None => Err(HandleError::Stale { handle }),
        }
    }

    fn release(&mut self, handle: Handle) -> Result<Option<HostValue>, HandleError> {
        if handle.is_sentinel() {
            return Ok(None);
        }

        let len = self.slots.len();
        let slot = self
            .slots
            .get_mut(handle.0 as usize)
            .ok_or(HandleError::OutOfRange { handle, len })?;

        if matches!(slot, Slot::Vacant { .. }) {
            return match self.config.free_policy {
                FreePolicy::Strict => Err(HandleError::DoubleFree { handle }),
                FreePolicy::Permissive => {
                    warn!(%handle, "Ignoring free of an already freed handle");
                    Ok(None)
                }
            };
        }

        let previous = std::mem::replace(
            slot,
            Slot::Vacant {
                next_free: self.free_head,
            },
        );
        self.free_head = Some(handle.0);
        self.live -= 1;
        match previous {
            Slot::Occupied(value) => Ok(Some(value)),
            Slot::Vacant { .. } => Ok(None),
        }
    }

    /// Allocate a second handle to the value behind `handle`.
    pub fn duplicate(&mut self, handle: Handle) -> BridgeResult<Handle> {
        let value = self.get(handle)?.clone();
        Ok(self.alloc(value)?)
    }

    /// Number of live dynamic handles.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Current slot capacity, including sentinels.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of slots in use or on the free list, including sentinels.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no dynamic handle has ever been allocated since the last reset.
    pub fn is_empty(&self) -> bool {
        self.slots.len() == Handle::RESERVED as usize
    }

    /// The configured free policy.
    pub fn free_policy(&self) -> FreePolicy {
        self.config.free_policy
    }

    /// Drop every dynamic value and return the number released.
    pub fn reset(&mut self) -> usize {
        let released = self.live;
        self.slots.truncate(Handle::RESERVED as usize);
        self.free_head = None;
        self.live = 0;
        debug!(released, "Reset handle table");
        released
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new(HandleTableConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> HandleTable {
        HandleTable::new(HandleTableConfig {
            free_policy: FreePolicy::Strict,
            ..Default::default()
        })
    }

    #[test]
    fn test_first_dynamic_handle_round_trip() {
        let mut table = strict();
        let handle = table.alloc(HostValue::from("canvas")).unwrap();
        assert_eq!(handle, Handle::new(4));
        assert_eq!(table.get(handle).unwrap().as_str(), Some("canvas"));

        table.free(handle).unwrap();
        assert_eq!(table.get(handle), Err(HandleError::Stale { handle }));

        let reused = table.alloc(HostValue::from(1.0)).unwrap();
        assert_eq!(reused, Handle::new(4));
    }

    #[test]
    fn test_sentinels_do_not_allocate() {
        let mut table = strict();
        assert_eq!(table.alloc(HostValue::Undefined).unwrap(), Handle::UNDEFINED);
        assert_eq!(table.alloc(HostValue::Null).unwrap(), Handle::NULL);
        assert_eq!(table.alloc(true.into()).unwrap(), Handle::TRUE);
        assert_eq!(table.alloc(false.into()).unwrap(), Handle::FALSE);
        assert_eq!(table.live_count(), 0);
        assert!(table.is_empty());

        table.free(Handle::TRUE).unwrap();
        assert_eq!(table.get(Handle::TRUE).unwrap(), &HostValue::Bool(true));
    }

    #[test]
    fn test_free_list_is_lifo() {
        let mut table = strict();
        let a = table.alloc(1.into()).unwrap();
        let b = table.alloc(2.into()).unwrap();
        let c = table.alloc(3.into()).unwrap();

        table.free(a).unwrap();
        table.free(c).unwrap();

        assert_eq!(table.alloc(4.into()).unwrap(), c);
        assert_eq!(table.alloc(5.into()).unwrap(), a);
        assert_eq!(table.get(b).unwrap().as_f64(), Some(2.0));
    }

    #[test]
    fn test_out_of_range() {
        let table = strict();
        let handle = Handle::new(99);
        assert_eq!(
            table.get(handle),
            Err(HandleError::OutOfRange { handle, len: 4 })
        );
    }

    #[test]
    fn test_double_free_policies() {
        let mut table = strict();
        let handle = table.alloc(7.into()).unwrap();
        table.free(handle).unwrap();
        assert_eq!(table.free(handle), Err(HandleError::DoubleFree { handle }));

        let mut table = HandleTable::new(HandleTableConfig {
            free_policy: FreePolicy::Permissive,
            ..Default::default()
        });
        let handle = table.alloc(7.into()).unwrap();
        table.free(handle).unwrap();
        assert!(table.free(handle).is_ok());
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_growth_and_exhaustion() {
        let mut table = HandleTable::new(HandleTableConfig {
            initial_capacity: 4,
            max_handles: 10,
            free_policy: FreePolicy::Strict,
        });

        for i in 0..6 {
            table.alloc(HostValue::from(i)).unwrap();
        }
        assert_eq!(table.capacity(), 10);

        let err = table.alloc(HostValue::from("one too many")).unwrap_err();
        assert_eq!(err, ResourceExhausted::HandleTable { limit: 10 });
    }

    #[test]
    fn test_take_and_duplicate() {
        let mut table = strict();
        let original = table.alloc("ctx".into()).unwrap();
        let copy = table.duplicate(original).unwrap();
        assert_ne!(original, copy);

        assert_eq!(table.take(original).unwrap().as_str(), Some("ctx"));
        assert_eq!(table.get(copy).unwrap().as_str(), Some("ctx"));
        assert_eq!(table.live_count(), 1);

        assert_eq!(table.duplicate(Handle::NULL).unwrap(), Handle::NULL);
    }

    #[test]
    fn test_reset() {
        let mut table = strict();
        table.alloc(1.into()).unwrap();
        table.alloc(2.into()).unwrap();

        assert_eq!(table.reset(), 2);
        assert_eq!(table.live_count(), 0);
        assert_eq!(table.alloc(3.into()).unwrap(), Handle::new(4));
    }
}
