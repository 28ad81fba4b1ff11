//! The single-slot pending-error register.

use crate::error::ErrorSlotViolation;
use crate::handles::Handle;

/// Holds the handle of at most one error raised by a host operation and not
/// yet collected by the guest.
#[derive(Debug, Default)]
pub struct PendingError {
    slot: Option<Handle>,
}

impl PendingError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an error handle.
    ///
    /// Fails without modifying the slot if an earlier error is still pending.
    pub fn store(&mut self, handle: Handle) -> Result<(), ErrorSlotViolation> {
        match self.slot {
            Some(pending) => Err(ErrorSlotViolation {
                pending,
                incoming: handle,
            }),
            None => {
                self.slot = Some(handle);
                Ok(())
            }
        }
    }

    /// Drain the slot.
    pub fn take(&mut self) -> Option<Handle> {
        self.slot.take()
    }

    /// The pending handle, without draining it.
    pub fn peek(&self) -> Option<Handle> {
        self.slot
    }

    pub fn is_set(&self) -> bool {
        self.slot.is_some()
    }
}
