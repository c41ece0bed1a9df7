//! The client-side RAII handle over a single hazard slot.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::hazard::HazardSlot;
use crate::smr;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Guard
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A hazard slot vended from the calling thread's record.
///
/// While a pointer is published through a guard (and the publication has been
/// validated against its source), the pointed-to object is protected from
/// reclamation. Dropping the guard clears the slot and recycles it for the
/// owning thread.
///
/// Guards are bound to the thread they were created on and must be dropped
/// before that thread detaches.
pub struct Guard {
    slot: *mut HazardSlot,
    // guards must neither move to another thread nor be shared
    _marker: PhantomData<*mut ()>,
}

/********** impl inherent *************************************************************************/

impl Guard {
    /// Acquires a free hazard slot from the calling thread's record.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not attached.
    #[inline]
    pub fn new() -> Self {
        let record = unsafe { &*smr::tls() };
        let slot = unsafe { record.data.hazards.alloc_guard(smr::instance().guard_blocks()) };
        Self { slot, _marker: PhantomData }
    }

    /// Publishes `ptr` in this guard's slot.
    ///
    /// On its own this does *not* protect `ptr`: the standard hazard pointer
    /// protocol requires re-validating that the source still contains `ptr`
    /// after publication, see [`protect`][Guard::protect].
    #[inline]
    pub fn protect_raw(&self, ptr: *mut ()) {
        unsafe { (*self.slot).protect(ptr) };
    }

    /// Loads from `src` and publishes the loaded pointer, repeating until the
    /// publication is validated by an unchanged re-load.
    ///
    /// The returned pointer (unless null) is protected from reclamation until
    /// the guard is cleared, dropped or re-used.
    #[inline]
    pub fn protect<T>(&self, src: &AtomicPtr<T>) -> *mut T {
        let mut curr = src.load(Ordering::Relaxed);
        loop {
            self.protect_raw(curr as *mut ());

            // (GRD:1) this `Acquire` re-load validates the publication: a
            // pointer retired before it was published here is re-observed (or
            // the loop restarts with the replacement value)
            let now = src.load(Ordering::Acquire);
            if now == curr {
                return now;
            }

            curr = now;
        }
    }

    /// Resets the slot to "no hazard" without releasing it.
    #[inline]
    pub fn clear(&self) {
        unsafe { (*self.slot).clear() };
    }
}

/********** impl Default **************************************************************************/

impl Default for Guard {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Drop *****************************************************************************/

impl Drop for Guard {
    #[inline]
    fn drop(&mut self) {
        let record = smr::tls_or_null();
        if record.is_null() {
            // the owner detached before dropping the guard; the slot stays
            // cleared and becomes available again when the record is reused
            unsafe { (*self.slot).clear() };
        } else {
            unsafe { (*record).data.hazards.free_guard(self.slot) };
        }
    }
}
