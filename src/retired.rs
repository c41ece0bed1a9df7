//! Storage for retired pointers until they can be safely freed.
//!
//! # Retired Pointers
//!
//! A retired pointer records everything needed to free a removed object at a
//! later time: the raw address, an opaque deleter function and an extra word
//! that is passed through to the deleter. Retired pointers are stored in
//! fixed-capacity blocks which form a per-thread, singly-linked list with a
//! cursor marking the next free cell. Everything in this module is mutated
//! exclusively by the thread owning the enclosing record (or by a thread that
//! has transiently claimed an abandoned record during a help-scan).
//!
//! # Sweeping
//!
//! A reclamation scan rewinds the cursor to the start of the list and walks
//! the previously live cells with independent pointers, re-inserting every
//! still-hazarded entry through [`safe_push`][RetiredArray::safe_push] and
//! freeing the rest. The rewound cursor always trails the sweep, which is
//! what makes it legal for a deleter to retire further pointers into the very
//! array being swept.

use core::ptr;

use crate::mem::{Block, BlockAllocator};
use crate::queue::RawNode;

/// The number of retired-pointer cells in one block.
pub(crate) const RETIRED_BLOCK_CAPACITY: usize = 256;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Retired
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The deleter invoked to free a retired pointer, receiving the pointer
/// itself and the extra word it was retired with.
pub type Deleter = unsafe fn(*mut (), *mut ());

unsafe fn noop_deleter(_: *mut (), _: *mut ()) {}

/// A pointer that has been removed from its data structure and awaits
/// reclamation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Retired {
    ptr: *mut (),
    deleter: Deleter,
    extra: *mut (),
}

/********** impl inherent *************************************************************************/

impl Retired {
    #[inline]
    pub fn new(ptr: *mut (), deleter: Deleter, extra: *mut ()) -> Self {
        Self { ptr, deleter, extra }
    }

    /// An inert placeholder for empty reserve cells.
    #[inline]
    fn null() -> Self {
        Self { ptr: ptr::null_mut(), deleter: noop_deleter, extra: ptr::null_mut() }
    }

    /// The address the hazard set is matched against.
    #[inline]
    pub fn address(&self) -> usize {
        self.ptr as usize
    }

    /// Frees the object by invoking its deleter.
    ///
    /// # Safety
    ///
    /// Must be called at most once, and only when no hazard slot publishes
    /// the address anymore.
    #[inline]
    pub unsafe fn free(self) {
        (self.deleter)(self.ptr, self.extra);
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RetiredBlock
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A fixed-capacity array of retired-pointer cells with a `next` link.
///
/// The link doubles as the free-list link while the block is pooled.
#[repr(C)]
pub(crate) struct RetiredBlock {
    next: *mut RetiredBlock,
    cells: [Retired; RETIRED_BLOCK_CAPACITY],
}

/********** impl inherent *************************************************************************/

impl RetiredBlock {
    /// Returns the address of the first cell.
    ///
    /// # Safety
    ///
    /// `block` must be valid.
    #[inline]
    pub unsafe fn first(block: *mut Self) -> *mut Retired {
        ptr::addr_of_mut!((*block).cells).cast()
    }

    /// Returns the one-past-the-end cell address.
    ///
    /// # Safety
    ///
    /// `block` must be valid.
    #[inline]
    pub unsafe fn last(block: *mut Self) -> *mut Retired {
        Self::first(block).add(RETIRED_BLOCK_CAPACITY)
    }

    /// Returns the successor block.
    ///
    /// # Safety
    ///
    /// `block` must be valid.
    #[inline]
    pub unsafe fn next_block(block: *mut Self) -> *mut Self {
        (*block).next
    }
}

/********** impl RawNode **************************************************************************/

impl RawNode for RetiredBlock {
    unsafe fn next(node: *mut Self) -> *mut Self {
        (*node).next
    }

    unsafe fn set_next(node: *mut Self, next: *mut Self) {
        (*node).next = next;
    }
}

/********** impl Block ****************************************************************************/

impl Block for RetiredBlock {
    unsafe fn init(block: *mut Self) {
        ptr::addr_of_mut!((*block).next).write(ptr::null_mut());
        let cells = Self::first(block);
        for i in 0..RETIRED_BLOCK_CAPACITY {
            cells.add(i).write(Retired::null());
        }
    }

    unsafe fn reset(block: *mut Self) {
        // stale cell contents are overwritten before they are ever read again
        (*block).next = ptr::null_mut();
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RetiredArray
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The extensible list of retired pointers of one thread record.
///
/// The live entries occupy the half-open cell range from the first cell of
/// `list_head` up to `current_cell`; everything beyond the cursor is empty
/// reserve. After every owner operation `current_block` is reachable from
/// `list_head` and `current_cell` lies within `current_block`.
pub(crate) struct RetiredArray {
    list_head: *mut RetiredBlock,
    list_tail: *mut RetiredBlock,
    current_block: *mut RetiredBlock,
    current_cell: *mut Retired,
    block_count: usize,
}

/********** impl inherent *************************************************************************/

impl RetiredArray {
    pub(crate) const fn new() -> Self {
        Self {
            list_head: ptr::null_mut(),
            list_tail: ptr::null_mut(),
            current_block: ptr::null_mut(),
            current_cell: ptr::null_mut(),
            block_count: 0,
        }
    }

    /// Ensures the list is non-empty, allocating the first block and placing
    /// the cursor at its start on a freshly created record.
    ///
    /// On a reused record this is a no-op: a properly finalized array is
    /// already rewound, while an abandoned one still holds live retirees
    /// which the new owner inherits. Rewinding here would leak them.
    ///
    /// # Safety
    ///
    /// Caller must have exclusive ownership of the array.
    pub(crate) unsafe fn init(&mut self, blocks: &BlockAllocator<RetiredBlock>) {
        if self.list_head.is_null() {
            let block = blocks.alloc();
            self.list_head = block;
            self.list_tail = block;
            self.block_count = 1;
            self.rewind();
        }
    }

    /// Resets the cursor; any live cells are logically discarded and must
    /// have been freed or migrated by the caller.
    ///
    /// # Safety
    ///
    /// Caller must have exclusive ownership of the array.
    pub(crate) unsafe fn fini(&mut self) {
        self.rewind();
    }

    /// Moves the cursor back to the first cell without touching the blocks.
    ///
    /// # Safety
    ///
    /// Caller must have exclusive ownership of the array.
    pub(crate) unsafe fn rewind(&mut self) {
        self.current_block = self.list_head;
        self.current_cell = RetiredBlock::first(self.list_head);
    }

    /// Returns `true` if no cells are live.
    ///
    /// # Safety
    ///
    /// The array must have been initialized.
    #[inline]
    pub(crate) unsafe fn empty(&self) -> bool {
        self.current_block == self.list_head && self.current_cell == RetiredBlock::first(self.list_head)
    }

    /// Appends `retired` at the cursor.
    ///
    /// Returns `false` when the array has just become full, in which case the
    /// caller must run a scan before appending again. If the cursor rests at
    /// the end of a block that has gained a successor since (the state left
    /// behind by a barren scan followed by [`extend`][RetiredArray::extend]),
    /// the append moves into the successor first.
    ///
    /// # Safety
    ///
    /// Caller must have exclusive ownership of the array, which must not be
    /// in the full state.
    pub(crate) unsafe fn push(&mut self, retired: Retired) -> bool {
        if self.current_cell == RetiredBlock::last(self.current_block) {
            let next = RetiredBlock::next_block(self.current_block);
            debug_assert!(!next.is_null(), "`push` called on a full retired array");
            self.current_block = next;
            self.current_cell = RetiredBlock::first(next);
        }

        self.current_cell.write(retired);
        self.current_cell = self.current_cell.add(1);

        if self.current_cell == RetiredBlock::last(self.current_block) {
            let next = RetiredBlock::next_block(self.current_block);
            if !next.is_null() {
                self.current_block = next;
                self.current_cell = RetiredBlock::first(next);
            }
        }

        !(self.current_block == self.list_tail
            && self.current_cell == RetiredBlock::last(self.current_block))
    }

    /// Re-inserts a sweep survivor into the rewound array.
    ///
    /// Cannot overflow, since the rewound cursor always trails the sweep that
    /// produced the survivor.
    ///
    /// # Safety
    ///
    /// See [`push`][RetiredArray::push].
    #[inline]
    pub(crate) unsafe fn safe_push(&mut self, retired: Retired) {
        let _ = self.push(retired);
    }

    /// Appends a fresh block at the tail.
    ///
    /// # Safety
    ///
    /// Caller must have exclusive ownership of the array.
    pub(crate) unsafe fn extend(&mut self, blocks: &BlockAllocator<RetiredBlock>) {
        let block = blocks.alloc();
        (*self.list_tail).next = block;
        self.list_tail = block;
        self.block_count += 1;
    }

    #[inline]
    pub(crate) fn list_head(&self) -> *mut RetiredBlock {
        self.list_head
    }

    #[inline]
    pub(crate) fn list_tail(&self) -> *mut RetiredBlock {
        self.list_tail
    }

    #[inline]
    pub(crate) fn current_block(&self) -> *mut RetiredBlock {
        self.current_block
    }

    #[inline]
    pub(crate) fn current_cell(&self) -> *mut Retired {
        self.current_cell
    }

    #[cfg(test)]
    pub(crate) fn block_count(&self) -> usize {
        self.block_count
    }

    /// Returns every block after `current_block` (the empty reserve) to the
    /// pool.
    ///
    /// # Safety
    ///
    /// Caller must have exclusive ownership of the array.
    pub(crate) unsafe fn release_spare_blocks(&mut self, blocks: &BlockAllocator<RetiredBlock>) {
        // a cursor resting at a block boundary (left behind by a barren scan
        // at full capacity followed by an extension) moves into the successor
        // first; dropping that successor would strand the array in a full
        // state with no room for the next append
        if self.current_cell == RetiredBlock::last(self.current_block) {
            let next = RetiredBlock::next_block(self.current_block);
            if !next.is_null() {
                self.current_block = next;
                self.current_cell = RetiredBlock::first(next);
            }
        }

        let mut spare = RetiredBlock::next_block(self.current_block);
        if spare.is_null() {
            return;
        }

        (*self.current_block).next = ptr::null_mut();
        self.list_tail = self.current_block;
        while !spare.is_null() {
            let next = RetiredBlock::next_block(spare);
            blocks.free(spare);
            self.block_count -= 1;
            spare = next;
        }
    }

    /// Returns every block to the pool, leaving the array uninitialized.
    ///
    /// # Safety
    ///
    /// Must only be called during teardown, after all live cells have been
    /// freed.
    pub(crate) unsafe fn release_all_blocks(&mut self, blocks: &BlockAllocator<RetiredBlock>) {
        let mut block = self.list_head;
        while !block.is_null() {
            let next = RetiredBlock::next_block(block);
            blocks.free(block);
            block = next;
        }

        self.list_head = ptr::null_mut();
        self.list_tail = ptr::null_mut();
        self.current_block = ptr::null_mut();
        self.current_cell = ptr::null_mut();
        self.block_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::{Retired, RetiredArray, RETIRED_BLOCK_CAPACITY};
    use crate::mem::BlockAllocator;

    unsafe fn count_free(ptr: *mut (), extra: *mut ()) {
        drop(Box::from_raw(ptr as *mut u64));
        (*(extra as *const AtomicUsize)).fetch_add(1, Ordering::Relaxed);
    }

    fn counted(value: u64, counter: &AtomicUsize) -> Retired {
        let ptr = Box::into_raw(Box::new(value)) as *mut ();
        Retired::new(ptr, count_free, counter as *const AtomicUsize as *mut ())
    }

    #[test]
    fn push_reports_full_at_capacity() {
        let blocks = BlockAllocator::new();
        let mut array = RetiredArray::new();
        unsafe { array.init(&blocks) };
        assert!(unsafe { array.empty() });

        let counter = AtomicUsize::new(0);
        for i in 0..RETIRED_BLOCK_CAPACITY - 1 {
            assert!(unsafe { array.push(counted(i as u64, &counter)) });
        }
        // the append filling the last cell signals exhaustion
        assert!(!unsafe { array.push(counted(0, &counter)) });
        assert!(!unsafe { array.empty() });

        // free everything by hand, then recycle the blocks
        unsafe {
            let mut cell = super::RetiredBlock::first(array.list_head());
            while cell != array.current_cell() {
                cell.read().free();
                cell = cell.add(1);
            }
            array.fini();
            array.release_all_blocks(&blocks);
        }
        assert_eq!(counter.load(Ordering::Relaxed), RETIRED_BLOCK_CAPACITY);
    }

    #[test]
    fn extend_creates_usable_capacity() {
        let blocks = BlockAllocator::new();
        let mut array = RetiredArray::new();
        unsafe { array.init(&blocks) };

        let counter = AtomicUsize::new(0);
        for i in 0..RETIRED_BLOCK_CAPACITY {
            let _ = unsafe { array.push(counted(i as u64, &counter)) };
        }
        assert_eq!(array.block_count(), 1);

        unsafe { array.extend(&blocks) };
        assert_eq!(array.block_count(), 2);

        // the cursor was resting at the old tail's end; appends move on into
        // the fresh block
        for i in 0..RETIRED_BLOCK_CAPACITY - 1 {
            assert!(unsafe { array.push(counted(i as u64, &counter)) });
        }
        assert!(!unsafe { array.push(counted(0, &counter)) });

        unsafe {
            let mut block = array.list_head();
            loop {
                let end = if block == array.current_block() {
                    array.current_cell()
                } else {
                    super::RetiredBlock::last(block)
                };
                let mut cell = super::RetiredBlock::first(block);
                while cell != end {
                    cell.read().free();
                    cell = cell.add(1);
                }
                if block == array.current_block() {
                    break;
                }
                block = super::RetiredBlock::next_block(block);
            }
            array.fini();
            array.release_all_blocks(&blocks);
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2 * RETIRED_BLOCK_CAPACITY);
    }

    #[test]
    fn release_spare_blocks_keeps_live_cells() {
        let blocks = BlockAllocator::new();
        let mut array = RetiredArray::new();
        unsafe { array.init(&blocks) };

        let counter = AtomicUsize::new(0);
        for i in 0..4 {
            let _ = unsafe { array.push(counted(i, &counter)) };
        }
        unsafe {
            array.extend(&blocks);
            array.extend(&blocks);
        }
        assert_eq!(array.block_count(), 3);

        unsafe { array.release_spare_blocks(&blocks) };
        assert_eq!(array.block_count(), 1);
        assert_eq!(array.list_tail(), array.current_block());
        assert!(!unsafe { array.empty() });

        unsafe {
            let mut cell = super::RetiredBlock::first(array.list_head());
            while cell != array.current_cell() {
                cell.read().free();
                cell = cell.add(1);
            }
            array.fini();
            array.release_all_blocks(&blocks);
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4);
    }
}
