//! Thread records and the global registry they are linked into.
//!
//! Every participating thread owns one record for the duration of its
//! attachment. Records are linked into a lock-free, append-only list: they
//! are never unlinked or deallocated before SMR teardown, only marked free
//! and reused by later threads. This is what allows scanners to traverse the
//! registry without any reclamation protection of their own.

use core::cell::UnsafeCell;
use core::iter::FusedIterator;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::alloc::Layout;

use crossbeam_utils::CachePadded;

use crate::hazard::{HazardArray, HazardSlot};
use crate::os::ThreadId;
use crate::retired::RetiredArray;

////////////////////////////////////////////////////////////////////////////////////////////////////
// ThreadData
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The per-thread reclamation state: the hazard array and the retired array.
pub(crate) struct ThreadData {
    pub(crate) hazards: HazardArray,
    /// Owner-exclusive; accessed through raw pointers at the points where
    /// ownership (or a transient help-scan claim) is established.
    pub(crate) retired: UnsafeCell<RetiredArray>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ThreadRecord
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A [`ThreadData`] decorated with its registry linkage and ownership state.
///
/// Records are allocated as a single contiguous region with the initial
/// hazard slot array at its tail (see [`ThreadRecord::layout`]).
#[repr(C)]
pub(crate) struct ThreadRecord {
    pub(crate) data: ThreadData,
    /// Next record in the registry; written once before publication.
    next: AtomicPtr<ThreadRecord>,
    /// The owning thread's id, [`ThreadId::NULL`] while the record is up for
    /// grabs. Padded, since it is the word every attach and help-scan CAS
    /// hammers on.
    owner: CachePadded<AtomicUsize>,
    /// `true` iff the retired array is empty *and* the owner is null.
    is_free: AtomicBool,
}

// records are shared across threads through the registry; the non-atomic
// parts are guarded by the ownership protocol on `owner`
unsafe impl Send for ThreadRecord {}
unsafe impl Sync for ThreadRecord {}

/********** impl inherent *************************************************************************/

impl ThreadRecord {
    pub(crate) fn new(slots: *mut HazardSlot, slot_count: usize, owner: ThreadId) -> Self {
        Self {
            data: ThreadData {
                hazards: HazardArray::new(slots, slot_count),
                retired: UnsafeCell::new(RetiredArray::new()),
            },
            next: AtomicPtr::new(ptr::null_mut()),
            owner: CachePadded::new(AtomicUsize::new(owner.to_word())),
            is_free: AtomicBool::new(false),
        }
    }

    /// Computes the layout of the contiguous record-plus-slots allocation and
    /// the offset of the slot array within it.
    pub(crate) fn layout(slot_count: usize) -> (Layout, usize) {
        let (layout, offset) = Layout::new::<Self>()
            .extend(Layout::array::<HazardSlot>(slot_count).unwrap())
            .unwrap();
        (layout.pad_to_align(), offset)
    }

    #[inline]
    pub(crate) fn next(&self) -> *mut ThreadRecord {
        self.next.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn owner(&self, order: Ordering) -> ThreadId {
        ThreadId::from_word(self.owner.load(order))
    }

    #[inline]
    pub(crate) fn set_owner(&self, id: ThreadId, order: Ordering) {
        self.owner.store(id.to_word(), order);
    }

    /// Attempts to install `new` as the owner, expecting `expected`.
    ///
    /// Exactly one contender succeeds for any observed owner value.
    #[inline]
    pub(crate) fn try_claim(&self, expected: ThreadId, new: ThreadId) -> bool {
        // (REC:1) `Acquire` on success: the claiming thread must observe the
        // previous owner's final writes to the record's arrays, which were
        // published by the `Release` owner-null store (REC:2, in the
        // coordinator)
        self.owner
            .compare_exchange(expected.to_word(), new.to_word(), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub(crate) fn is_free(&self, order: Ordering) -> bool {
        self.is_free.load(order)
    }

    #[inline]
    pub(crate) fn set_free(&self, free: bool, order: Ordering) {
        self.is_free.store(free, order);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ThreadList
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The lock-free, append-only registry of all thread records.
#[derive(Debug)]
pub(crate) struct ThreadList {
    head: AtomicPtr<ThreadRecord>,
}

/********** impl inherent *************************************************************************/

impl ThreadList {
    #[inline]
    pub const fn new() -> Self {
        Self { head: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Links `record` at the head of the registry.
    pub fn push(&self, record: *mut ThreadRecord) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*record).next.store(head, Ordering::Relaxed) };

            // (LIS:1) this `Release` CAS publishes the record and
            // synchronizes-with the `Acquire` head load in (LIS:2)
            match self.head.compare_exchange_weak(head, record, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(now) => head = now,
            }
        }
    }

    /// Iterates over all currently published records.
    ///
    /// Once published, a record's `next` chain never changes, so only the
    /// head load requires synchronization.
    #[inline]
    pub fn iter(&self) -> Iter<'_> {
        // (LIS:2) this `Acquire` load synchronizes-with the `Release` CAS in (LIS:1)
        Iter { curr: unsafe { self.head.load(Ordering::Acquire).as_ref() } }
    }

    /// Detaches the entire list for teardown.
    ///
    /// Requires exclusive access through the `&mut self` receiver.
    #[inline]
    pub fn take_all_unsync(&mut self) -> *mut ThreadRecord {
        self.head.swap(ptr::null_mut(), Ordering::Relaxed)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Iter
////////////////////////////////////////////////////////////////////////////////////////////////////

pub(crate) struct Iter<'a> {
    curr: Option<&'a ThreadRecord>,
}

/********** impl Iterator *************************************************************************/

impl<'a> Iterator for Iter<'a> {
    type Item = &'a ThreadRecord;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let record = self.curr.take();
        if let Some(record) = record {
            self.curr = unsafe { record.next().as_ref() };
        }

        record
    }
}

/********** impl FusedIterator ********************************************************************/

impl FusedIterator for Iter<'_> {}

#[cfg(test)]
mod tests {
    use core::sync::atomic::Ordering;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::{ThreadList, ThreadRecord};
    use crate::hazard::HazardSlot;
    use crate::os::ThreadId;

    struct TestRecord {
        record: Box<ThreadRecord>,
        _slots: Box<[HazardSlot]>,
    }

    unsafe impl Send for TestRecord {}
    unsafe impl Sync for TestRecord {}

    fn record(owner: ThreadId) -> TestRecord {
        let mut slots = (0..16).map(|_| HazardSlot::new()).collect::<Box<[_]>>();
        let record = Box::new(ThreadRecord::new(slots.as_mut_ptr(), 16, owner));
        TestRecord { record, _slots: slots }
    }

    #[test]
    fn append_is_lifo_and_monotonic() {
        let list = ThreadList::new();
        let records: Vec<_> = (0..4).map(|_| record(ThreadId::NULL)).collect();

        for r in &records {
            list.push(&*r.record as *const ThreadRecord as *mut ThreadRecord);
        }

        let collected: Vec<*const ThreadRecord> =
            list.iter().map(|r| r as *const ThreadRecord).collect();
        let expected: Vec<*const ThreadRecord> =
            records.iter().rev().map(|r| &*r.record as *const ThreadRecord).collect();
        assert_eq!(collected, expected);
    }

    #[test]
    fn claim_is_exclusive_under_contention() {
        const CONTENDERS: usize = 8;

        let test = record(ThreadId::NULL);
        let record = &*test.record;
        let barrier = Arc::new(Barrier::new(CONTENDERS));

        let winners: usize = thread::scope(|scope| {
            let handles: Vec<_> = (0..CONTENDERS)
                .map(|i| {
                    let barrier = Arc::clone(&barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        record.try_claim(ThreadId::NULL, ThreadId::from_word(i + 1)) as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(winners, 1);
        assert!(!record.owner(Ordering::Relaxed).is_null());
    }

    #[test]
    fn concurrent_append_loses_no_record() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 8;

        let list = ThreadList::new();
        let records: Vec<_> = (0..THREADS * PER_THREAD).map(|_| record(ThreadId::NULL)).collect();

        thread::scope(|scope| {
            for chunk in records.chunks(PER_THREAD) {
                let list = &list;
                scope.spawn(move || {
                    for r in chunk {
                        list.push(&*r.record as *const ThreadRecord as *mut ThreadRecord);
                    }
                });
            }
        });

        assert_eq!(list.iter().count(), THREADS * PER_THREAD);
    }
}
