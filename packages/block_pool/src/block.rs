use std::ptr::NonNull;

use num_integer::Integer;

use crate::{
    BlockStats, BufferOwner, Carving, DetachedBuffer, FreeListLinks, SlotBitmap, SlotHeader,
    SlotLayout,
};

/// A buffer divided into equally sized slots, with a bitmap recording which slots are
/// allocated.
///
/// Besides the slots, a block carries its membership in the two pool-wide structures: the
/// directory bucket it was assigned to (fixed for its lifetime and also recorded in every slot
/// header) and its links in the free-list (only meaningful while it has vacant slots).
#[derive(Debug)]
pub(crate) struct Block {
    /// The buffer exactly as it was obtained, needed to give it back.
    buffer: NonNull<u8>,
    len: usize,
    owner: BufferOwner,

    /// Start of slot 0. May be later than `buffer` if the buffer was misaligned.
    first_slot: NonNull<u8>,
    stride: usize,
    capacity: usize,

    occupied: SlotBitmap,
    vacant: usize,

    /// Index of a vacant slot, valid whenever `vacant > 0`. Refreshed after every allocation so
    /// the next one can usually skip the bitmap scan.
    vacancy_hint: usize,

    bucket: usize,

    free_list_links: FreeListLinks,
}

impl Block {
    /// Builds a block from `buffer` and stamps the directory bucket into every slot header.
    #[must_use]
    pub(crate) fn new(
        buffer: DetachedBuffer,
        carving: Carving,
        layout: &SlotLayout,
        bucket: usize,
    ) -> Self {
        let (buffer, len, owner) = buffer.into_parts();
        let header = SlotHeader::for_bucket(bucket);
        let stride = layout.stride();

        for index in 0..carving.capacity {
            // Cannot overflow because the carving only counts slots that fit into the buffer.
            let offset = index.wrapping_mul(stride);

            // SAFETY: carve() guarantees `capacity` slots of `stride` bytes fit after
            // `first_slot`, and SlotHeader has an alignment of 1.
            unsafe {
                carving
                    .first_slot
                    .add(offset)
                    .cast::<SlotHeader>()
                    .write(header);
            }
        }

        Self {
            buffer,
            len,
            owner,
            first_slot: carving.first_slot,
            stride,
            capacity: carving.capacity,
            occupied: SlotBitmap::new(carving.capacity),
            vacant: carving.capacity,
            vacancy_hint: 0,
            bucket,
            free_list_links: FreeListLinks::default(),
        }
    }

    #[must_use]
    pub(crate) fn bucket(&self) -> usize {
        self.bucket
    }

    #[must_use]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub(crate) fn vacant(&self) -> usize {
        self.vacant
    }

    #[must_use]
    pub(crate) fn allocated(&self) -> usize {
        // Cannot wrap because `vacant` never exceeds `capacity`.
        self.capacity.wrapping_sub(self.vacant)
    }

    #[must_use]
    pub(crate) fn is_full(&self) -> bool {
        self.vacant == 0
    }

    #[must_use]
    pub(crate) fn is_unused(&self) -> bool {
        self.vacant == self.capacity
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Address of the first slot.
    #[must_use]
    pub(crate) fn start_addr(&self) -> usize {
        self.first_slot.addr().get()
    }

    /// Address one past the last slot.
    #[must_use]
    pub(crate) fn end_addr(&self) -> usize {
        // Cannot wrap because the slots lie inside a real buffer.
        self.start_addr()
            .wrapping_add(self.capacity.wrapping_mul(self.stride))
    }

    #[must_use]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        (self.start_addr()..self.end_addr()).contains(&addr)
    }

    pub(crate) fn free_list_links(&self) -> &FreeListLinks {
        &self.free_list_links
    }

    pub(crate) fn free_list_links_mut(&mut self) -> &mut FreeListLinks {
        &mut self.free_list_links
    }

    /// Marks the hinted vacant slot as allocated and returns a pointer to its object.
    ///
    /// # Panics
    ///
    /// Panics if the block is full.
    #[must_use]
    pub(crate) fn reserve_slot(&mut self, layout: &SlotLayout) -> NonNull<u8> {
        assert!(
            !self.is_full(),
            "cannot reserve a slot in a full block of capacity {}",
            self.capacity
        );

        let index = self.vacancy_hint;
        let was_occupied = self.occupied.replace(index, true);

        assert!(
            !was_occupied,
            "vacancy hint {index} pointed at an occupied slot in block of capacity {}",
            self.capacity
        );

        // Cannot wrap because we asserted above that the block was not full.
        self.vacant = self.vacant.wrapping_sub(1);

        if self.vacant > 0 {
            // Slots are usually handed out in ascending order, so the next one over is the
            // best guess. The bitmap falls back to a full scan if that word is saturated.
            self.vacancy_hint = self
                .occupied
                .next_clear_from(index.wrapping_add(1))
                .expect("a block with vacant slots must have a clear bit in its bitmap");
        }

        self.object_ptr(index, layout)
    }

    /// Marks slot `index` as vacant again.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the slot is not currently allocated, which means the caller
    /// freed the same object twice.
    pub(crate) fn release_slot(&mut self, index: usize) {
        let was_occupied = self.occupied.replace(index, false);

        debug_assert!(
            was_occupied,
            "slot {index} of block at {:#x} was released while vacant - double free?",
            self.start_addr()
        );

        // Cannot wrap because the slot was occupied, so `vacant < capacity`.
        self.vacant = self.vacant.wrapping_add(1);
        self.vacancy_hint = index;
    }

    /// Whether slot `index` is currently allocated.
    #[must_use]
    pub(crate) fn is_slot_allocated(&self, index: usize) -> bool {
        self.occupied.is_set(index)
    }

    /// Maps an object pointer back to the index of its slot.
    ///
    /// Returns `None` if the pointer is outside the block or does not point at the start of an
    /// object.
    #[must_use]
    pub(crate) fn slot_index_of(&self, object: NonNull<u8>, layout: &SlotLayout) -> Option<usize> {
        let slot_addr = object.addr().get().checked_sub(layout.object_offset())?;
        let offset = slot_addr.checked_sub(self.start_addr())?;

        let (index, misalignment) = offset.div_rem(&self.stride);

        (misalignment == 0 && index < self.capacity).then_some(index)
    }

    #[must_use]
    pub(crate) fn object_ptr(&self, index: usize, layout: &SlotLayout) -> NonNull<u8> {
        debug_assert!(index < self.capacity);

        // Cannot overflow because the slot lies inside the buffer.
        let offset = index
            .wrapping_mul(self.stride)
            .wrapping_add(layout.object_offset());

        // SAFETY: The slot is inside the buffer and the object lies inside its slot.
        unsafe { self.first_slot.add(offset) }
    }

    #[must_use]
    pub(crate) fn stats(&self) -> BlockStats {
        BlockStats::new(self.buffer, self.len, self.vacant, self.allocated())
    }

    /// Gives up the block metadata, keeping only the memory that must go back to its owner.
    pub(crate) fn into_detached(self) -> DetachedBuffer {
        DetachedBuffer::new(self.buffer, self.len, self.owner)
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    pub(crate) fn integrity_check(&self) {
        assert_eq!(
            self.occupied.len(),
            self.capacity,
            "bitmap of block at {:#x} does not cover its slots",
            self.start_addr()
        );

        assert_eq!(
            self.vacant,
            self.capacity.wrapping_sub(self.occupied.count_ones()),
            "vacant slot count of block at {:#x} disagrees with its bitmap",
            self.start_addr()
        );

        if self.vacant > 0 {
            assert!(
                !self.occupied.is_set(self.vacancy_hint),
                "vacancy hint {} of block at {:#x} points at an occupied slot",
                self.vacancy_hint,
                self.start_addr()
            );
        }

        assert!(
            self.end_addr() <= self.buffer.addr().get().wrapping_add(self.len),
            "slots of block at {:#x} extend past the end of its buffer",
            self.start_addr()
        );
    }
}

// SAFETY: The block owns its buffer exclusively; the raw pointers never alias memory owned by
// anything else. The pool only touches blocks while holding its lock, and the release function
// inside the owner is `Send`.
unsafe impl Send for Block {}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::alloc::{Layout, System};

    use super::*;
    use crate::allocate;

    fn layout() -> SlotLayout {
        SlotLayout::calculate(Layout::from_size_align(12, 4).unwrap())
    }

    fn new_block(slots: usize, bucket: usize) -> Block {
        let layout = layout();
        let buffer = allocate(&System, slots * layout.stride(), layout.align()).unwrap();
        let carving = layout.carve(buffer.ptr(), buffer.len()).unwrap();

        Block::new(buffer, carving, &layout, bucket)
    }

    fn release(block: Block) {
        block.into_detached().release(&System);
    }

    fn header_of(object: NonNull<u8>, layout: &SlotLayout) -> SlotHeader {
        unsafe { object.sub(layout.object_offset()).cast::<SlotHeader>().read() }
    }

    #[test]
    fn new_block_is_unused_and_stamped() {
        let layout = layout();
        let block = new_block(10, 7);

        assert_eq!(block.capacity(), 10);
        assert_eq!(block.vacant(), 10);
        assert_eq!(block.allocated(), 0);
        assert!(block.is_unused());
        assert!(!block.is_full());

        for index in 0..10 {
            let object = block.object_ptr(index, &layout);
            assert_eq!(header_of(object, &layout).bucket(), Some(7));
        }

        block.integrity_check();
        release(block);
    }

    #[test]
    fn reserve_hands_out_slots_in_order() {
        let layout = layout();
        let mut block = new_block(4, 0);

        let objects: Vec<_> = (0..4).map(|_| block.reserve_slot(&layout)).collect();

        for (index, object) in objects.iter().enumerate() {
            assert_eq!(block.slot_index_of(*object, &layout), Some(index));
            assert!(block.is_slot_allocated(index));
        }

        assert!(block.is_full());
        block.integrity_check();
        release(block);
    }

    #[test]
    fn released_slot_is_reused_first() {
        let layout = layout();
        let mut block = new_block(4, 0);

        let a = block.reserve_slot(&layout);
        let _b = block.reserve_slot(&layout);

        block.release_slot(block.slot_index_of(a, &layout).unwrap());
        assert_eq!(block.vacant(), 3);

        let c = block.reserve_slot(&layout);
        assert_eq!(c, a);

        block.integrity_check();
        release(block);
    }

    #[test]
    fn hint_skips_occupied_neighbors() {
        let layout = layout();
        let mut block = new_block(3, 0);

        let a = block.reserve_slot(&layout);
        let _b = block.reserve_slot(&layout);
        block.release_slot(block.slot_index_of(a, &layout).unwrap());

        // The freed slot becomes the hint, after it slot 1 is still taken.
        let c = block.reserve_slot(&layout);
        assert_eq!(c, a);

        let d = block.reserve_slot(&layout);
        assert_eq!(block.slot_index_of(d, &layout), Some(2));
        assert!(block.is_full());

        release(block);
    }

    #[test]
    fn hint_wraps_around_to_lower_slots() {
        let layout = layout();
        let mut block = new_block(3, 0);

        let objects: Vec<_> = (0..3).map(|_| block.reserve_slot(&layout)).collect();

        block.release_slot(0);
        block.release_slot(2);

        // The last freed slot is handed out first, then the scan wraps to slot 0.
        assert_eq!(block.reserve_slot(&layout), objects[2]);
        assert_eq!(block.reserve_slot(&layout), objects[0]);
        assert!(block.is_full());

        block.integrity_check();
        release(block);
    }

    #[test]
    fn slot_index_rejects_foreign_and_misaligned_pointers() {
        let layout = layout();
        let mut block = new_block(4, 0);
        let object = block.reserve_slot(&layout);

        assert_eq!(block.slot_index_of(unsafe { object.add(1) }, &layout), None);
        assert_eq!(
            block.slot_index_of(unsafe { object.add(4 * layout.stride()) }, &layout),
            None
        );
        assert_eq!(block.slot_index_of(NonNull::dangling(), &layout), None);

        release(block);
    }

    #[test]
    fn contains_covers_exactly_the_slots() {
        let layout = layout();
        let block = new_block(4, 0);

        assert!(block.contains(block.start_addr()));
        assert!(block.contains(block.end_addr() - 1));
        assert!(!block.contains(block.end_addr()));
        assert_eq!(block.end_addr() - block.start_addr(), 4 * layout.stride());

        release(block);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn double_release_panics() {
        let layout = layout();
        let mut block = new_block(4, 0);
        let object = block.reserve_slot(&layout);
        let index = block.slot_index_of(object, &layout).unwrap();

        block.release_slot(index);
        block.release_slot(index);
    }

    #[test]
    #[should_panic]
    fn reserve_in_full_block_panics() {
        let layout = layout();
        let mut block = new_block(1, 0);

        _ = block.reserve_slot(&layout);
        _ = block.reserve_slot(&layout);
    }

    #[test]
    fn stats_reflect_occupancy() {
        let layout = layout();
        let mut block = new_block(5, 0);
        _ = block.reserve_slot(&layout);
        _ = block.reserve_slot(&layout);

        let stats = block.stats();
        assert_eq!(stats.objects_cached(), 3);
        assert_eq!(stats.objects_allocated(), 2);
        assert_eq!(stats.len(), 5 * layout.stride());

        release(block);
    }
}
