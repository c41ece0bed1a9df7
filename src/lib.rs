//! Dynamic hazard pointer based safe memory reclamation (SMR) for lock-free
//! data structures.
//!
//! # Overview
//!
//! Lock-free containers cannot free a removed node immediately, since other
//! threads may still hold raw references into it. This crate implements the
//! *dynamic hazard pointer* scheme: every participating thread publishes the
//! pointers it is about to dereference in its *hazard slots*, and removed
//! nodes are handed to [`retire`] instead of being freed. A retired pointer
//! is reclaimed by a later *scan*, and only once it is absent from every
//! thread's published hazards.
//!
//! The number of hazard slots per thread is not bounded: a thread's slot
//! array grows on demand by chaining fixed-size guard blocks, so any number
//! of [`Guard`]s can be live at once.
//!
//! # Usage
//!
//! The scheme is driven by an explicitly constructed process-wide instance.
//! Every thread using it attaches once before its first operation and
//! detaches when it is done; detaching reclaims what it can and leaves the
//! rest for other threads to adopt.
//!
//! ```
//! use std::sync::atomic::{AtomicPtr, Ordering};
//!
//! dhp::construct(16);
//! dhp::attach_thread();
//!
//! let shared = AtomicPtr::new(Box::into_raw(Box::new(42_u64)));
//!
//! // read the current value under the protection of a guard
//! let guard = dhp::Guard::new();
//! let ptr = guard.protect(&shared);
//! assert_eq!(unsafe { *ptr }, 42);
//!
//! // unlink and retire the node; it is freed by a later scan, once no
//! // guard publishes it anymore
//! let old = shared.swap(std::ptr::null_mut(), Ordering::AcqRel);
//! unsafe { dhp::retire_box(old) };
//!
//! drop(guard);
//! dhp::detach_thread();
//! unsafe { dhp::destruct(true) };
//! ```
//!
//! # Threads that never detach
//!
//! If a thread exits without calling [`detach_thread`], its record and any
//! unreclaimed retirees remain in the registry. The next thread to detach
//! adopts them (a *help-scan*), so the memory is recovered without any
//! background machinery.

mod config;
mod guard;
mod hazard;
mod list;
mod mem;
mod os;
mod queue;
mod retired;
mod smr;

pub use crate::config::{Config, ConfigBuilder};
pub use crate::guard::Guard;
pub use crate::mem::{AllocFn, FreeFn};
pub use crate::retired::Deleter;

/// Creates the process-wide SMR instance with (at least 16)
/// `initial_hazard_count` hazard slots per thread record.
///
/// Calling this while an instance already exists is a no-op.
#[inline]
pub fn construct(initial_hazard_count: usize) {
    smr::construct(Config::with_initial_hazard_count(initial_hazard_count));
}

/// Same as [`construct`], with the parameters given as a [`Config`].
#[inline]
pub fn construct_with(config: Config) {
    smr::construct(config);
}

/// Tears the process-wide SMR instance down, freeing every outstanding
/// retired pointer through its deleter.
///
/// With `detach_all`, records still owned by a thread are wound down first as
/// if their owners had called [`detach_thread`].
///
/// # Safety
///
/// No thread may call into this crate's API once teardown has begun, and any
/// thread still attached (other than the caller, with `detach_all`) must have
/// exited.
pub unsafe fn destruct(detach_all: bool) {
    smr::destruct(detach_all);
}

/// Replaces the allocation hooks all SMR-internal memory is obtained through.
///
/// The defaults are `std::alloc::alloc` and `std::alloc::dealloc`.
///
/// # Panics
///
/// Panics if the SMR instance currently exists; hooks may only be swapped
/// before [`construct`] or after [`destruct`].
///
/// # Safety
///
/// `alloc` must return memory valid for the given layout (or null, which
/// aborts), and `free` must accept every pointer previously returned by
/// `alloc` for the same layout.
pub unsafe fn set_memory_allocator(alloc: AllocFn, free: FreeFn) {
    assert!(!smr::is_constructed(), "allocation hooks must be set while no SMR instance exists");
    mem::set_hooks(alloc, free);
}

/// Associates the calling thread with a thread record.
///
/// A no-op when the thread is already attached.
///
/// # Panics
///
/// Panics if the SMR instance has not been constructed.
#[inline]
pub fn attach_thread() {
    smr::attach_thread();
}

/// Releases the calling thread's record.
///
/// Runs a final reclamation cycle, adopts the retirees of records whose
/// owners have exited without detaching and marks the record for reuse. A
/// no-op when the thread is not attached.
#[inline]
pub fn detach_thread() {
    smr::detach_thread();
}

/// Marks `ptr` as removed from its data structure, to be freed by invoking
/// `deleter(ptr, extra)` once no hazard slot publishes it anymore.
///
/// Never fails: if the calling thread's retired array is full, a scan runs
/// synchronously (growing the array if even that frees nothing).
///
/// # Panics
///
/// Panics if the calling thread is not attached.
///
/// # Safety
///
/// `ptr` must be unlinked, so that no thread can create a *new* hazard for it
/// afterwards, and must not be retired again. The deleter runs on whichever
/// thread performs the reclaiming scan.
#[inline]
pub unsafe fn retire(ptr: *mut (), deleter: Deleter, extra: *mut ()) {
    smr::retire(ptr, deleter, extra);
}

/// Retires a pointer obtained from [`Box::into_raw`], freeing it by dropping
/// the re-constituted box.
///
/// # Safety
///
/// Same as [`retire`]; additionally `ptr` must stem from `Box::into_raw`.
#[inline]
pub unsafe fn retire_box<T>(ptr: *mut T) {
    unsafe fn drop_box<T>(ptr: *mut (), _: *mut ()) {
        drop(Box::from_raw(ptr as *mut T));
    }

    smr::retire(ptr as *mut (), drop_box::<T>, core::ptr::null_mut());
}

/// Runs a reclamation cycle on the calling thread's record.
///
/// # Panics
///
/// Panics if the calling thread is not attached.
#[inline]
pub fn scan() {
    smr::scan_current();
}
