//! Host-callable wrappers around guest closures.
//!
//! A guest closure is four integers: a pointer to its captured state, a
//! dispatch index, and the table indices of an invoke and a destroy
//! trampoline. The host wraps them in a [`HostClosure`] whose reference
//! count starts at one, the reference held by the guest.
//!
//! Every invocation holds an extra reference for its duration and clears the
//! stored data pointer while the guest runs, so a closure that is released
//! from inside its own call is only destroyed once the outermost invocation
//! has unwound. Destruction runs at most once, either when the count reaches
//! zero or when the last host-side clone is dropped and the
//! [`ClosureRegistry`] reclaims it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::abi::GuestVal;
use crate::error::{BridgeResult, ClosureError};
use crate::guest::GuestTrampolines;

/// The guest-side description of a closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosureSpec {
    /// Pointer to the closure's captured state.
    pub data: u32,
    /// Index passed back to the trampolines to select the closure body.
    pub dispatch: u32,
    /// Function table index of the destroy trampoline.
    pub destroy: u32,
    /// Function table index of the invoke trampoline.
    pub invoke: u32,
}

#[derive(Debug)]
struct ClosureState {
    data: u32,
    refs: u32,
    destroyed: bool,
}

#[derive(Debug)]
struct ClosureCell {
    id: u64,
    dispatch: u32,
    destroy: u32,
    invoke: u32,
    state: Mutex<ClosureState>,
}

impl ClosureCell {
    /// Mark the cell destroyed and return the data pointer to hand to the
    /// destroy trampoline, or `None` if it was already destroyed.
    fn begin_destroy(&self) -> Option<u32> {
        let mut state = self.state.lock();
        if state.destroyed {
            return None;
        }
        state.destroyed = true;
        state.refs = 0;
        Some(std::mem::take(&mut state.data))
    }
}

/// Tracks live closures and those awaiting reclamation.
///
/// When the last host-side clone of a [`HostClosure`] drops before the
/// closure was destroyed, its cell is queued here. [`drain`](Self::drain)
/// runs the queued destructors at a point where calling into the guest is
/// safe.
#[derive(Debug, Default)]
pub struct ClosureRegistry {
    next_id: AtomicU64,
    live: AtomicUsize,
    pending: Mutex<Vec<Arc<ClosureCell>>>,
}

impl ClosureRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wrap a guest closure. The new closure starts with one reference.
    pub fn wrap(self: &Arc<Self>, spec: ClosureSpec) -> HostClosure {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.live.fetch_add(1, Ordering::Relaxed);

        let cell = Arc::new(ClosureCell {
            id,
            dispatch: spec.dispatch,
            destroy: spec.destroy,
            invoke: spec.invoke,
            state: Mutex::new(ClosureState {
                data: spec.data,
                refs: 1,
                destroyed: false,
            }),
        });

        HostClosure(Arc::new(ClosureRoot {
            cell,
            registry: Arc::clone(self),
        }))
    }

    /// Number of closures that have not been destroyed.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Number of closures queued for reclamation.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run the destructors of every queued closure.
    ///
    /// All queued closures are processed even if one destructor fails; the
    /// first failure is returned. Returns the number of closures destroyed.
    pub fn drain<G>(&self, guest: &mut G) -> BridgeResult<usize>
    where
        G: GuestTrampolines + ?Sized,
    {
        let queued = std::mem::take(&mut *self.pending.lock());
        if queued.is_empty() {
            return Ok(0);
        }

        let mut destroyed = 0;
        let mut first_error = None;
        for cell in queued {
            match self.destroy_cell(&cell, guest) {
                Ok(true) => destroyed += 1,
                Ok(false) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        debug!(destroyed, "Reclaimed dropped closures");

        match first_error {
            Some(err) => Err(err),
            None => Ok(destroyed),
        }
    }

    fn destroy_cell<G>(&self, cell: &ClosureCell, guest: &mut G) -> BridgeResult<bool>
    where
        G: GuestTrampolines + ?Sized,
    {
        let Some(data) = cell.begin_destroy() else {
            return Ok(false);
        };
        self.live.fetch_sub(1, Ordering::Relaxed);
        debug!(id = cell.id, data, "Destroying closure");
        guest.destroy_closure(cell.destroy, data, cell.dispatch)?;
        Ok(true)
    }
}

struct ClosureRoot {
    cell: Arc<ClosureCell>,
    registry: Arc<ClosureRegistry>,
}

impl Drop for ClosureRoot {
    fn drop(&mut self) {
        if !self.cell.state.lock().destroyed {
            self.registry.pending.lock().push(Arc::clone(&self.cell));
        }
    }
}

/// A guest closure callable from the host.
///
/// Clones share the same closure. Dropping the last clone queues the closure
/// for reclamation if the guest never released it.
#[derive(Clone)]
pub struct HostClosure(Arc<ClosureRoot>);

impl HostClosure {
    /// Process-unique identifier of this closure.
    pub fn id(&self) -> u64 {
        self.0.cell.id
    }

    /// Current reference count.
    pub fn ref_count(&self) -> u32 {
        self.0.cell.state.lock().refs
    }

    /// The stored data pointer. Zero while an invocation is running or after
    /// destruction.
    pub fn data(&self) -> u32 {
        self.0.cell.state.lock().data
    }

    /// Whether the destroy trampoline has run.
    pub fn is_destroyed(&self) -> bool {
        self.0.cell.state.lock().destroyed
    }

    /// Whether two handles name the same closure.
    pub fn same_closure(&self, other: &HostClosure) -> bool {
        Arc::ptr_eq(&self.0.cell, &other.0.cell)
    }

    /// Take an additional reference.
    pub fn add_ref(&self) {
        let mut state = self.0.cell.state.lock();
        if !state.destroyed {
            state.refs += 1;
        }
    }

    /// Call the closure.
    ///
    /// Returns `Ok(None)` without entering the guest if the closure has
    /// already been destroyed.
    pub fn invoke<G>(&self, guest: &mut G, args: &[GuestVal]) -> BridgeResult<Option<Vec<GuestVal>>>
    where
        G: GuestTrampolines + ?Sized,
    {
        let cell = &self.0.cell;
        let data = {
            let mut state = cell.state.lock();
            if state.destroyed {
                return Ok(None);
            }
            state.refs += 1;
            std::mem::take(&mut state.data)
        };

        let result = guest.invoke_closure(cell.invoke, data, cell.dispatch, args);

        {
            let mut state = cell.state.lock();
            if !state.destroyed {
                state.data = data;
            }
        }
        let released = self.unref(guest);

        let values = result?;
        released?;
        Ok(Some(values))
    }

    /// Release one reference, destroying the closure when none remain.
    pub fn unref<G>(&self, guest: &mut G) -> BridgeResult<()>
    where
        G: GuestTrampolines + ?Sized,
    {
        let cell = &self.0.cell;
        {
            let mut state = cell.state.lock();
            if state.refs == 0 {
                return Err(ClosureError::RefCountUnderflow { id: cell.id }.into());
            }
            state.refs -= 1;
            if state.refs > 0 {
                return Ok(());
            }
        }
        self.0.registry.destroy_cell(cell, guest).map(drop)
    }
}

impl fmt::Debug for HostClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.cell.state.lock();
        f.debug_struct("HostClosure")
            .field("id", &self.0.cell.id)
            .field("refs", &state.refs)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::testing::SimulatedGuest;

    const INVOKE: u32 = 1;
    const DESTROY: u32 = 2;

    fn spec() -> ClosureSpec {
        ClosureSpec {
            data: 0x100,
            dispatch: 7,
            destroy: DESTROY,
            invoke: INVOKE,
        }
    }

    #[test]
    fn test_invoke_passes_data_and_args() {
        let registry = ClosureRegistry::new();
        let mut guest = SimulatedGuest::new();
        guest.set_trampoline(INVOKE, |_, data, dispatch, args| {
            let arg = args[0].as_i32().unwrap_or_default();
            Ok(vec![GuestVal::I32(data as i32 + dispatch as i32 + arg)])
        });

        let closure = registry.wrap(spec());
        let out = closure.invoke(&mut guest, &[GuestVal::I32(1)]).unwrap();

        assert_eq!(out, Some(vec![GuestVal::I32(0x100 + 7 + 1)]));
        assert_eq!(closure.ref_count(), 1);
        assert_eq!(closure.data(), 0x100);
        assert!(guest.destroyed().is_empty());
    }

    #[test]
    fn test_data_cleared_during_invocation() {
        let registry = ClosureRegistry::new();
        let mut guest = SimulatedGuest::new();
        let closure = registry.wrap(spec());

        let observed = Arc::new(Mutex::new(None));
        let probe = closure.clone();
        let sink = Arc::clone(&observed);
        guest.set_trampoline(INVOKE, move |_, _, _, _| {
            *sink.lock() = Some((probe.data(), probe.ref_count()));
            Ok(vec![])
        });

        closure.invoke(&mut guest, &[]).unwrap();
        assert_eq!(*observed.lock(), Some((0, 2)));
    }

    #[test]
    fn test_recursive_invocation_destroys_once() {
        let registry = ClosureRegistry::new();
        let mut guest = SimulatedGuest::new();
        let closure = registry.wrap(spec());

        // The outer call re-enters the closure once, and the inner call
        // releases the guest's reference.
        let reentry = Arc::new(Mutex::new(Some(closure.clone())));
        let release = Arc::new(Mutex::new(None::<HostClosure>));
        let (reentry_slot, release_slot) = (Arc::clone(&reentry), Arc::clone(&release));
        guest.set_trampoline(INVOKE, move |guest, _, _, _| {
            let next = reentry_slot.lock().take();
            if let Some(inner) = next {
                *release_slot.lock() = Some(inner.clone());
                inner.invoke(guest, &[])?;
                assert!(!inner.is_destroyed());
            } else {
                let target = release_slot.lock().take();
                if let Some(target) = target {
                    target.unref(guest)?;
                    assert!(guest.destroyed().is_empty());
                }
            }
            Ok(vec![])
        });

        closure.invoke(&mut guest, &[]).unwrap();

        assert!(closure.is_destroyed());
        assert_eq!(guest.destroyed(), &[(DESTROY, 0x100, 7)]);
        assert_eq!(registry.live_count(), 0);

        // Further calls are no-ops.
        assert_eq!(closure.invoke(&mut guest, &[]).unwrap(), None);
        drop(closure);
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(guest.destroyed().len(), 1);
    }

    #[test]
    fn test_unref_underflow() {
        let registry = ClosureRegistry::new();
        let mut guest = SimulatedGuest::new();
        let closure = registry.wrap(spec());

        closure.unref(&mut guest).unwrap();
        assert!(closure.is_destroyed());

        let err = closure.unref(&mut guest).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Closure(ClosureError::RefCountUnderflow { .. })
        ));
        assert_eq!(guest.destroyed().len(), 1);
    }

    #[test]
    fn test_dropped_closure_is_reclaimed() {
        let registry = ClosureRegistry::new();
        let mut guest = SimulatedGuest::new();

        let closure = registry.wrap(spec());
        let clone = closure.clone();
        drop(closure);
        assert_eq!(registry.pending_count(), 0);
        drop(clone);
        assert_eq!(registry.pending_count(), 1);

        assert_eq!(registry.drain(&mut guest).unwrap(), 1);
        assert_eq!(guest.destroyed(), &[(DESTROY, 0x100, 7)]);
        assert_eq!(registry.live_count(), 0);
        assert_eq!(registry.drain(&mut guest).unwrap(), 0);
    }

    #[test]
    fn test_invoke_error_still_releases() {
        let registry = ClosureRegistry::new();
        let mut guest = SimulatedGuest::new();
        guest.set_trampoline(INVOKE, |_, _, _, _| Err(BridgeError::guest("invoke", "unreachable")));

        let closure = registry.wrap(spec());
        assert!(closure.invoke(&mut guest, &[]).is_err());
        assert_eq!(closure.ref_count(), 1);
        assert_eq!(closure.data(), 0x100);
    }
}
