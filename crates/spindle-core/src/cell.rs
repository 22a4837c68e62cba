//! Shared-static cell for runtime-internal global state.

use core::cell::UnsafeCell;

/// An `UnsafeCell` that may live in a `static`.
///
/// Every access must happen under an external lock (the descriptor mutex,
/// the heap lock, ...); the cell itself provides no synchronization.
pub(crate) struct RacyCell<T>(UnsafeCell<T>);

impl<T> RacyCell<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Raw pointer to the contents.
    ///
    /// # Safety
    ///
    /// The caller must hold whichever lock guards this cell and must not
    /// create aliasing mutable references.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn get_mut(&self) -> &mut T {
        // SAFETY: exclusivity is the caller's contract.
        unsafe { &mut *self.0.get() }
    }
}

// SAFETY: all access is serialized by the callers' locks.
unsafe impl<T> Sync for RacyCell<T> {}
