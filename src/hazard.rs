//! Hazard slots and the per-thread array they are organized in.
//!
//! # Hazard Slots
//!
//! Whenever a thread reads a value in a data structure from shared memory it
//! has to publish the loaded pointer in one of its hazard slots before the
//! reference can be safely dereferenced. Any thread attempting to reclaim a
//! retired record first collects every published slot of every registered
//! thread and must not free a record that is still present in that set.
//!
//! # Growth
//!
//! Each thread record carries an initial contiguous slot array. When a thread
//! needs more simultaneous hazards than that, its array is extended by
//! chaining blocks of [`GUARD_BLOCK_CAPACITY`] slots acquired from the global
//! block pool. The chain only ever grows at its head and extension blocks
//! stay with the record until teardown, so concurrent scanners can traverse
//! it without any protection of their own.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::mem::{Block, BlockAllocator};
use crate::queue::RawNode;

/// The number of hazard slots in one extension block.
pub(crate) const GUARD_BLOCK_CAPACITY: usize = 16;

////////////////////////////////////////////////////////////////////////////////////////////////////
// HazardSlot
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A single-word publication slot visible to all threads.
///
/// A null value means "no hazard". Only the owning thread stores into the
/// slot, every thread may read it.
#[derive(Debug)]
pub(crate) struct HazardSlot {
    protected: AtomicPtr<()>,
    /// Intrusive link in the owning thread's free-slot list. Owner-only.
    free_next: UnsafeCell<*mut HazardSlot>,
}

/********** impl inherent *************************************************************************/

impl HazardSlot {
    #[inline]
    pub fn new() -> Self {
        Self { protected: AtomicPtr::new(ptr::null_mut()), free_next: UnsafeCell::new(ptr::null_mut()) }
    }

    /// Publishes `ptr` in this slot.
    #[inline]
    pub fn protect(&self, ptr: *mut ()) {
        // (HAZ:1) this `Release` store synchronizes-with the `Acquire` loads
        // during hazard collection (HAZ:4)
        self.protected.store(ptr, Ordering::Release);
    }

    /// Resets the slot to "no hazard".
    #[inline]
    pub fn clear(&self) {
        self.protected.store(ptr::null_mut(), Ordering::Release);
    }

    #[inline]
    pub fn protected(&self, order: Ordering) -> *mut () {
        self.protected.load(order)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// GuardBlock
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A fixed-capacity extension block of hazard slots.
///
/// The `next` field doubles as the chain link while the block is part of a
/// thread's hazard array and as the free-list link while it is pooled.
#[repr(C)]
pub(crate) struct GuardBlock {
    next: AtomicPtr<GuardBlock>,
    slots: [HazardSlot; GUARD_BLOCK_CAPACITY],
}

/********** impl inherent *************************************************************************/

impl GuardBlock {
    #[inline]
    fn slots(&self) -> &[HazardSlot; GUARD_BLOCK_CAPACITY] {
        &self.slots
    }
}

/********** impl RawNode **************************************************************************/

impl RawNode for GuardBlock {
    unsafe fn next(node: *mut Self) -> *mut Self {
        (*node).next.load(Ordering::Relaxed)
    }

    unsafe fn set_next(node: *mut Self, next: *mut Self) {
        (*node).next.store(next, Ordering::Relaxed);
    }
}

/********** impl Block ****************************************************************************/

impl Block for GuardBlock {
    unsafe fn init(block: *mut Self) {
        ptr::addr_of_mut!((*block).next).write(AtomicPtr::new(ptr::null_mut()));
        let slots = ptr::addr_of_mut!((*block).slots) as *mut HazardSlot;
        for i in 0..GUARD_BLOCK_CAPACITY {
            slots.add(i).write(HazardSlot::new());
        }
    }

    unsafe fn reset(block: *mut Self) {
        (*block).next.store(ptr::null_mut(), Ordering::Relaxed);
        for slot in (*block).slots.iter() {
            slot.protected.store(ptr::null_mut(), Ordering::Relaxed);
            *slot.free_next.get() = ptr::null_mut();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// HazardArray
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The dynamically extensible set of hazard slots of one thread record.
///
/// The initial slot array lives at the tail of the record allocation, the
/// extended part is a chain of guard blocks published through an atomic head.
/// Vending and recycling of slots goes through an intrusive free-slot list
/// threaded through the slots themselves, which only the owning thread ever
/// touches.
pub(crate) struct HazardArray {
    /// The initial slot array at the tail of the record allocation.
    initial: *mut HazardSlot,
    initial_count: usize,
    /// Head of the chain of extension blocks, grows at the head only.
    extended: AtomicPtr<GuardBlock>,
    /// Owner-only free-slot list.
    free_head: UnsafeCell<*mut HazardSlot>,
}

/********** impl inherent *************************************************************************/

impl HazardArray {
    pub(crate) fn new(initial: *mut HazardSlot, initial_count: usize) -> Self {
        Self {
            initial,
            initial_count,
            extended: AtomicPtr::new(ptr::null_mut()),
            free_head: UnsafeCell::new(ptr::null_mut()),
        }
    }

    /// Clears every slot and rebuilds the free-slot list over the initial
    /// array and all retained extension blocks.
    ///
    /// # Safety
    ///
    /// Must only be called by the (newly attached) owner of the record.
    pub(crate) unsafe fn init(&self) {
        let mut head = ptr::null_mut();

        // link the extension blocks first so that the initial slots end up at
        // the front of the free list
        let mut block = self.extended.load(Ordering::Relaxed);
        while !block.is_null() {
            for slot in (*block).slots().iter() {
                slot.protected.store(ptr::null_mut(), Ordering::Relaxed);
                *slot.free_next.get() = head;
                head = slot as *const HazardSlot as *mut HazardSlot;
            }
            block = (*block).next.load(Ordering::Relaxed);
        }

        for i in (0..self.initial_count).rev() {
            let slot = self.initial.add(i);
            (*slot).protected.store(ptr::null_mut(), Ordering::Relaxed);
            *(*slot).free_next.get() = head;
            head = slot;
        }

        *self.free_head.get() = head;
    }

    /// Clears every live slot.
    ///
    /// The extension blocks are retained; a concurrent scanner may still be
    /// traversing the chain, so it must stay intact until SMR teardown.
    ///
    /// # Safety
    ///
    /// Must only be called by the owner of the record.
    pub(crate) unsafe fn clear(&self) {
        // (HAZ:2) these `Release` stores guarantee that a subsequent scan does
        // not observe a spurious hazard of the detached thread
        for i in 0..self.initial_count {
            (*self.initial.add(i)).clear();
        }

        let mut block = self.extended.load(Ordering::Relaxed);
        while !block.is_null() {
            for slot in (*block).slots().iter() {
                slot.clear();
            }
            block = (*block).next.load(Ordering::Relaxed);
        }
    }

    /// Vends a free hazard slot, extending the array by one guard block when
    /// every existing slot is taken.
    ///
    /// # Safety
    ///
    /// Must only be called by the owner of the record.
    pub(crate) unsafe fn alloc_guard(&self, blocks: &BlockAllocator<GuardBlock>) -> *mut HazardSlot {
        let head = *self.free_head.get();
        if !head.is_null() {
            *self.free_head.get() = *(*head).free_next.get();
            return head;
        }

        // all slots are taken: chain a fresh block and link its slots
        let block = blocks.alloc();
        let slots = (*block).slots();
        let mut head = ptr::null_mut();
        for slot in slots.iter().skip(1).rev() {
            *slot.free_next.get() = head;
            head = slot as *const HazardSlot as *mut HazardSlot;
        }
        *self.free_head.get() = head;

        (*block).next.store(self.extended.load(Ordering::Relaxed), Ordering::Relaxed);
        // (HAZ:3) this `Release` store publishes the block's initialized slots
        // and synchronizes-with the `Acquire` chain-head load in (HAZ:5)
        self.extended.store(block, Ordering::Release);

        &slots[0] as *const HazardSlot as *mut HazardSlot
    }

    /// Clears `slot` and returns it to the free-slot list.
    ///
    /// # Safety
    ///
    /// Must only be called by the owner of the record, with a slot vended by
    /// [`alloc_guard`][HazardArray::alloc_guard].
    pub(crate) unsafe fn free_guard(&self, slot: *mut HazardSlot) {
        (*slot).clear();
        *(*slot).free_next.get() = *self.free_head.get();
        *self.free_head.get() = slot;
    }

    /// Collects the addresses of all currently published hazards into
    /// `plist`. Callable from any thread.
    pub(crate) fn collect(&self, plist: &mut Vec<usize>) {
        for i in 0..self.initial_count {
            // (HAZ:4) these `Acquire` loads synchronize-with the `Release`
            // publication stores (HAZ:1)
            let ptr = unsafe { &*self.initial.add(i) }.protected(Ordering::Acquire);
            if !ptr.is_null() {
                plist.push(ptr as usize);
            }
        }

        // (HAZ:5) this `Acquire` load synchronizes-with the `Release` chain
        // publication in (HAZ:3); all inner links are immutable afterwards
        let mut block = self.extended.load(Ordering::Acquire);
        while !block.is_null() {
            let block_ref = unsafe { &*block };
            for slot in block_ref.slots().iter() {
                let ptr = slot.protected(Ordering::Acquire);
                if !ptr.is_null() {
                    plist.push(ptr as usize);
                }
            }
            block = block_ref.next.load(Ordering::Relaxed);
        }
    }

    /// Hands all extension blocks back to the pool.
    ///
    /// # Safety
    ///
    /// Must only be called during teardown, when no thread can be scanning
    /// the chain anymore.
    pub(crate) unsafe fn release_blocks(&self, blocks: &BlockAllocator<GuardBlock>) {
        let mut block = self.extended.swap(ptr::null_mut(), Ordering::Relaxed);
        while !block.is_null() {
            let next = (*block).next.load(Ordering::Relaxed);
            blocks.free(block);
            block = next;
        }
    }
}
