//! Thread identity primitives used for thread record ownership.

use cfg_if::cfg_if;

////////////////////////////////////////////////////////////////////////////////////////////////////
// ThreadId
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An OS-level thread identifier with a reserved null value.
///
/// The null id marks a thread record as unowned and claimable; it is never
/// returned by [`current_thread_id`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ThreadId(usize);

/********** impl inherent *************************************************************************/

impl ThreadId {
    pub const NULL: Self = Self(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the id as a plain machine word for storage in an atomic.
    #[inline]
    pub fn to_word(self) -> usize {
        self.0
    }

    #[inline]
    pub fn from_word(word: usize) -> Self {
        Self(word)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// free functions
////////////////////////////////////////////////////////////////////////////////////////////////////

cfg_if! {
    if #[cfg(unix)] {
        /// Returns the id of the calling thread.
        #[inline]
        pub(crate) fn current_thread_id() -> ThreadId {
            ThreadId(unsafe { libc::pthread_self() as usize })
        }

        /// Probes whether the thread identified by `id` is still running.
        ///
        /// Uses the null-signal probe; ids of threads that have been joined
        /// are stale and the probe is best-effort for them, exactly like the
        /// liveness checks of the platform layers this is modelled on.
        #[inline]
        pub(crate) fn is_thread_alive(id: ThreadId) -> bool {
            !id.is_null() && unsafe { libc::pthread_kill(id.0 as libc::pthread_t, 0) == 0 }
        }
    } else {
        use std::cell::Cell;

        std::thread_local! {
            static FALLBACK_ID: Cell<usize> = Cell::new(0);
        }

        static ID_COUNTER: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(1);

        #[inline]
        pub(crate) fn current_thread_id() -> ThreadId {
            ThreadId(FALLBACK_ID.with(|id| {
                if id.get() == 0 {
                    id.set(ID_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed));
                }
                id.get()
            }))
        }

        /// Without an OS probe every non-null thread is assumed to be alive,
        /// which is the conservative choice: records of exited threads are
        /// still recovered once their owner id is cleared or at teardown.
        #[inline]
        pub(crate) fn is_thread_alive(id: ThreadId) -> bool {
            !id.is_null()
        }
    }
}
