//! The SMR coordinator: singleton lifecycle, thread attachment and the two
//! reclamation scans.
//!
//! # Scan
//!
//! `scan` collects every hazard currently published by any registered thread
//! into a sorted list and then sweeps the calling record's retired pointers
//! against it: entries found in the hazard set survive (they are re-inserted
//! into the rewound array), everything else is freed on the spot. A pointer
//! is only ever freed if it was absent from the hazard set for the entire
//! sweep, which together with the publish-then-revalidate protocol on the
//! reader side establishes the reclamation safety property.
//!
//! # Help-Scan
//!
//! A detaching thread additionally adopts the retired pointers of records
//! whose owner has died without detaching (or has already moved on, leaving
//! retirees behind). Claiming such a record goes through a CAS on its owner
//! word, so concurrent helpers serialize and each orphan is migrated exactly
//! once.

use std::alloc::Layout;
use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use log::{debug, trace};

use crate::config::Config;
use crate::hazard::{GuardBlock, HazardSlot};
use crate::list::{ThreadList, ThreadRecord};
use crate::mem::{self, BlockAllocator};
use crate::os::{self, ThreadId};
use crate::retired::{Deleter, Retired, RetiredBlock};

////////////////////////////////////////////////////////////////////////////////////////////////////
// globals
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The enforced lower bound on the initial hazard slot count.
const MIN_INITIAL_HAZARD_COUNT: usize = 16;

static INSTANCE: AtomicPtr<Smr> = AtomicPtr::new(ptr::null_mut());

thread_local! {
    /// The calling thread's handle into its registry record; null while
    /// detached.
    static TLS: Cell<*mut ThreadRecord> = Cell::new(ptr::null_mut());
}

/// Creates the SMR singleton unless it already exists.
pub(crate) fn construct(config: Config) {
    if INSTANCE.load(Ordering::Relaxed).is_null() {
        let smr = mem::alloc_raw(Layout::new::<Smr>()) as *mut Smr;
        unsafe { smr.write(Smr::new(config)) };

        if INSTANCE
            .compare_exchange(ptr::null_mut(), smr, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            // lost the construction race
            unsafe {
                smr.drop_in_place();
                mem::free_raw(smr as *mut u8, Layout::new::<Smr>());
            }
            return;
        }

        debug!("constructed SMR instance");
    }
}

/// Tears the SMR singleton down, see [`crate::destruct`] for the contract.
pub(crate) unsafe fn destruct(detach_all: bool) {
    let smr = INSTANCE.swap(ptr::null_mut(), Ordering::Acquire);
    if smr.is_null() {
        return;
    }

    if detach_all {
        (*smr).detach_all_threads();
    }

    // allow this thread to re-attach after a later `construct`
    TLS.with(|tls| tls.set(ptr::null_mut()));

    smr.drop_in_place();
    mem::free_raw(smr as *mut u8, Layout::new::<Smr>());
    debug!("destructed SMR instance");
}

#[inline]
pub(crate) fn is_constructed() -> bool {
    !INSTANCE.load(Ordering::Relaxed).is_null()
}

/// Returns the SMR singleton.
///
/// # Panics
///
/// Panics if the singleton has not been constructed.
#[inline]
pub(crate) fn instance() -> &'static Smr {
    let smr = INSTANCE.load(Ordering::Acquire);
    assert!(!smr.is_null(), "the SMR instance has not been constructed");
    unsafe { &*smr }
}

/// Returns the calling thread's record.
///
/// # Panics
///
/// Panics if the thread is not attached.
#[inline]
pub(crate) fn tls() -> *mut ThreadRecord {
    let record = TLS.with(Cell::get);
    assert!(!record.is_null(), "the calling thread is not attached");
    record
}

#[inline]
pub(crate) fn tls_or_null() -> *mut ThreadRecord {
    TLS.with(Cell::get)
}

/// Associates the calling thread with a (possibly recycled) thread record.
pub(crate) fn attach_thread() {
    TLS.with(|tls| {
        if tls.get().is_null() {
            tls.set(instance().alloc_thread_data());
        }
    });
}

/// Releases the calling thread's record.
pub(crate) fn detach_thread() {
    TLS.with(|tls| {
        let record = tls.get();
        if !record.is_null() {
            tls.set(ptr::null_mut());
            unsafe { instance().free_thread_data(&*record) };
        }
    });
}

/// Appends `(ptr, deleter, extra)` to the calling thread's retired array,
/// running a synchronous scan when the array runs full.
pub(crate) unsafe fn retire(ptr: *mut (), deleter: Deleter, extra: *mut ()) {
    let record = &*tls();
    let retired = record.data.retired.get();
    if !(*retired).push(Retired::new(ptr, deleter, extra)) {
        instance().scan(record);
    }
}

/// Runs a reclamation cycle on the calling thread's record.
pub(crate) fn scan_current() {
    let record = unsafe { &*tls() };
    instance().scan(record);
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Smr
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The global state of the reclamation scheme.
pub(crate) struct Smr {
    /// The registry of all thread records.
    thread_list: ThreadList,
    /// The size of every record's initial hazard slot array.
    initial_hazard_count: usize,
    /// Upper watermark of hazards observed by any scan; used to presize scan
    /// buffers and never decreased.
    last_plist_size: CachePadded<AtomicUsize>,
    guard_blocks: BlockAllocator<GuardBlock>,
    retired_blocks: BlockAllocator<RetiredBlock>,
}

unsafe impl Send for Smr {}
unsafe impl Sync for Smr {}

/********** impl inherent *************************************************************************/

impl Smr {
    fn new(config: Config) -> Self {
        let initial_hazard_count = config.initial_hazard_count().max(MIN_INITIAL_HAZARD_COUNT);
        Self {
            thread_list: ThreadList::new(),
            initial_hazard_count,
            last_plist_size: CachePadded::new(AtomicUsize::new(initial_hazard_count * 64)),
            guard_blocks: BlockAllocator::new(),
            retired_blocks: BlockAllocator::new(),
        }
    }

    #[inline]
    pub(crate) fn guard_blocks(&self) -> &BlockAllocator<GuardBlock> {
        &self.guard_blocks
    }

    #[cfg(test)]
    pub(crate) fn thread_list(&self) -> &ThreadList {
        &self.thread_list
    }

    /// Allocates the contiguous record-plus-slots region and constructs the
    /// record in place, owned by the calling thread.
    fn create_thread_data(&self) -> *mut ThreadRecord {
        let count = self.initial_hazard_count;
        let (layout, slots_offset) = ThreadRecord::layout(count);

        unsafe {
            let mem = mem::alloc_raw(layout);
            let slots = mem.add(slots_offset) as *mut HazardSlot;
            for i in 0..count {
                slots.add(i).write(HazardSlot::new());
            }

            let record = mem as *mut ThreadRecord;
            record.write(ThreadRecord::new(slots, count, os::current_thread_id()));
            record
        }
    }

    unsafe fn destroy_thread_data(&self, record: *mut ThreadRecord) {
        let (layout, _) = ThreadRecord::layout(self.initial_hazard_count);
        record.drop_in_place();
        mem::free_raw(record as *mut u8, layout);
    }

    /// Claims a free record from the registry or creates and publishes a
    /// fresh one, then initializes its arrays for the calling thread.
    fn alloc_thread_data(&self) -> *mut ThreadRecord {
        let me = os::current_thread_id();

        // first try to reuse a record released by some detached thread
        for record in self.thread_list.iter() {
            if !record.try_claim(ThreadId::NULL, me) {
                continue;
            }

            // (REC:3) the `Release` pairs with the `Acquire` is_free load in
            // `help_scan`: a record seen as non-free is owned or has retirees
            record.set_free(false, Ordering::Release);
            let record = record as *const ThreadRecord as *mut ThreadRecord;
            unsafe { self.init_thread_data(record) };
            trace!("attached thread to a recycled record");
            return record;
        }

        // none available: allocate and publish a new record
        let record = self.create_thread_data();
        self.thread_list.push(record);
        unsafe { self.init_thread_data(record) };
        trace!("attached thread to a new record");
        record
    }

    unsafe fn init_thread_data(&self, record: *mut ThreadRecord) {
        (*record).data.hazards.init();
        (*(*record).data.retired.get()).init(&self.retired_blocks);
    }

    /// Winds down `record` on behalf of its current owner: clears its
    /// hazards, reclaims and adopts what it can and releases ownership.
    pub(crate) unsafe fn free_thread_data(&self, record: &ThreadRecord) {
        record.data.hazards.clear();
        self.scan(record);
        self.help_scan(record);

        let retired = record.data.retired.get();
        if (*retired).empty() {
            (*retired).fini();
            // (REC:4) `Release`: whoever observes the record as free must
            // also observe its drained retired array
            record.set_free(true, Ordering::Release);
        } else {
            // the survivors stay behind for adoption by a later help-scan;
            // only the empty reserve blocks go back to the pool
            (*retired).release_spare_blocks(&self.retired_blocks);
        }

        // (REC:2) this `Release` store pairs with the `Acquire` claim (REC:1)
        record.set_owner(ThreadId::NULL, Ordering::Release);
        trace!("detached thread from its record");
    }

    /// Frees every retired pointer of `record` that no thread currently
    /// hazards.
    pub(crate) fn scan(&self, record: &ThreadRecord) {
        // Stage 1: collect and sort all published hazards
        let mut plist = Vec::with_capacity(self.last_plist_size.load(Ordering::Relaxed));
        for node in self.thread_list.iter() {
            if !node.owner(Ordering::Relaxed).is_null() {
                node.data.hazards.collect(&mut plist);
            }
        }

        let hint = self.last_plist_size.load(Ordering::Relaxed);
        if plist.len() > hint {
            // the hint only ever grows; losing this race is inconsequential
            let _ = self.last_plist_size.compare_exchange_weak(
                hint,
                plist.len(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }

        plist.sort_unstable();

        // Stage 2: rewind the retired array and sweep the previously live
        // cells against the hazard set
        let retired = record.data.retired.get();
        let mut free_count = 0usize;

        unsafe {
            let last_block = (*retired).current_block();
            let last_cell = (*retired).current_cell();
            (*retired).rewind();

            let mut block = (*retired).list_head();
            loop {
                let is_last = block == last_block;
                let end = if is_last { last_cell } else { RetiredBlock::last(block) };

                let mut cell = RetiredBlock::first(block);
                while cell != end {
                    let entry = cell.read();
                    if plist.binary_search(&entry.address()).is_ok() {
                        (*retired).safe_push(entry);
                    } else {
                        // no reference into the retired array is held here, so
                        // the deleter may allocate or even retire recursively
                        entry.free();
                        free_count += 1;
                    }
                    cell = cell.add(1);
                }

                if is_last {
                    break;
                }
                block = RetiredBlock::next_block(block);
            }

            trace!("scan: {} hazards, {} retirees freed", plist.len(), free_count);

            // a barren scan at full capacity must grow the array, otherwise a
            // continuously retrying `retire` could never make progress
            if free_count == 0
                && last_block == (*retired).list_tail()
                && last_cell == RetiredBlock::last(last_block)
            {
                (*retired).extend(&self.retired_blocks);
            }
        }
    }

    /// Adopts the retired pointers of every abandoned record into `record`,
    /// then scans.
    ///
    /// # Safety
    ///
    /// `record` must be owned by the calling thread.
    pub(crate) unsafe fn help_scan(&self, record: &ThreadRecord) {
        let me = os::current_thread_id();

        for node in self.thread_list.iter() {
            // the record being helped is wound down by the surrounding
            // detach; claiming it here would migrate it into itself
            if ptr::eq(node, record) {
                continue;
            }

            // (REC:5) `Acquire`, pairing with (REC:4): a free record is
            // guaranteed to hold no retirees
            if node.is_free(Ordering::Acquire) {
                continue;
            }

            let owner = node.owner(Ordering::Relaxed);
            if !owner.is_null() && os::is_thread_alive(owner) {
                continue;
            }
            // several detaching threads may compete for the same orphan; the
            // CAS on the owner word serializes them
            if !node.try_claim(owner, me) {
                continue;
            }

            debug!("help_scan: adopting an abandoned record's retirees");

            let src = node.data.retired.get();
            let dest = record.data.retired.get();

            let src_block = (*src).current_block();
            let src_cell = (*src).current_cell();
            let mut block = (*src).list_head();
            loop {
                let is_last = block == src_block;
                let end = if is_last { src_cell } else { RetiredBlock::last(block) };

                let mut cell = RetiredBlock::first(block);
                while cell != end {
                    if !(*dest).push(cell.read()) {
                        self.scan(record);
                    }
                    cell = cell.add(1);
                }

                if is_last {
                    break;
                }
                block = RetiredBlock::next_block(block);
            }

            (*src).fini();
            node.set_free(true, Ordering::Relaxed);
            // (REC:2) release the claim again, see `free_thread_data`
            node.set_owner(ThreadId::NULL, Ordering::Release);
        }

        self.scan(record);
    }

    /// Winds down every record that still has an owner; used by
    /// `destruct(detach_all = true)`.
    unsafe fn detach_all_threads(&self) {
        for node in self.thread_list.iter() {
            if !node.owner(Ordering::Relaxed).is_null() {
                self.free_thread_data(node);
            }
        }
    }
}

/********** impl Drop *****************************************************************************/

impl Drop for Smr {
    fn drop(&mut self) {
        let mut curr = self.thread_list.take_all_unsync();
        while !curr.is_null() {
            unsafe {
                let record = &*curr;
                debug_assert!(
                    {
                        let owner = record.owner(Ordering::Relaxed);
                        owner.is_null()
                            || owner == os::current_thread_id()
                            || !os::is_thread_alive(owner)
                    },
                    "SMR teardown while attached threads are alive"
                );

                let retired = record.data.retired.get();
                if !(*retired).list_head().is_null() {
                    // free every still-live retiree unconditionally
                    let last_block = (*retired).current_block();
                    let last_cell = (*retired).current_cell();
                    let mut block = (*retired).list_head();
                    loop {
                        let is_last = block == last_block;
                        let end = if is_last { last_cell } else { RetiredBlock::last(block) };

                        let mut cell = RetiredBlock::first(block);
                        while cell != end {
                            cell.read().free();
                            cell = cell.add(1);
                        }

                        if is_last {
                            break;
                        }
                        block = RetiredBlock::next_block(block);
                    }

                    (*retired).fini();
                    (*retired).release_all_blocks(&self.retired_blocks);
                }

                record.data.hazards.clear();
                record.data.hazards.release_blocks(&self.guard_blocks);
                record.set_free(true, Ordering::Relaxed);

                let next = record.next();
                self.destroy_thread_data(curr);
                curr = next;
            }
        }
        // the block pools drain their free lists through the free hook when
        // they are dropped right after this
    }
}
