use std::iter;

use crate::{BlockArena, BlockId};

/// Position of a block in the [`FreeList`]. Stored inside the block itself.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct FreeListLinks {
    listed: bool,
    prev: Option<BlockId>,
    next: Option<BlockId>,
}

impl FreeListLinks {
    #[must_use]
    pub(crate) fn is_listed(&self) -> bool {
        self.listed
    }
}

/// All blocks that have at least one vacant slot, ordered by ascending vacant slot count.
///
/// Allocations are served from the head, i.e. from the block that is closest to being full.
/// This packs live objects together and lets lightly used blocks drain completely, at which
/// point they can be given back to the backing allocator.
///
/// Since every allocation or deallocation changes the vacant count of one block by exactly one,
/// order is restored by moving that block a short distance from where it already is instead of
/// sorting.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    head: Option<BlockId>,
    tail: Option<BlockId>,
    len: usize,
}

impl FreeList {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The block with the fewest vacant slots, if any block has vacant slots.
    #[must_use]
    pub(crate) fn head(&self) -> Option<BlockId> {
        self.head
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Adds a block at its sorted position, after any blocks with the same vacant count.
    pub(crate) fn insert(&mut self, arena: &mut BlockArena, id: BlockId) {
        let vacant = arena.get(id).vacant();

        // New blocks are usually unused, so they belong near the tail.
        let mut anchor = self.tail;

        while let Some(candidate) = anchor {
            if arena.get(candidate).vacant() <= vacant {
                break;
            }

            anchor = arena.get(candidate).free_list_links().prev;
        }

        self.link_after(arena, id, anchor);
    }

    /// Adds a block that just got its first vacant slot back.
    ///
    /// No listed block can have fewer than one vacant slot, so the head is always a sorted
    /// position for it.
    pub(crate) fn insert_first_vacancy(&mut self, arena: &mut BlockArena, id: BlockId) {
        debug_assert_eq!(arena.get(id).vacant(), 1);

        self.link_after(arena, id, None);
    }

    /// # Panics
    ///
    /// Panics if the block is not listed.
    pub(crate) fn remove(&mut self, arena: &mut BlockArena, id: BlockId) {
        let links = *arena.get(id).free_list_links();

        assert!(
            links.listed,
            "{id:?} cannot be removed from the free-list because it is not listed"
        );

        match links.prev {
            Some(prev) => arena.get_mut(prev).free_list_links_mut().next = links.next,
            None => self.head = links.next,
        }

        match links.next {
            Some(next) => arena.get_mut(next).free_list_links_mut().prev = links.prev,
            None => self.tail = links.prev,
        }

        *arena.get_mut(id).free_list_links_mut() = FreeListLinks::default();

        // Cannot wrap because the block was listed.
        self.len = self.len.wrapping_sub(1);
    }

    /// Restores order after the vacant count of a listed block went down by one.
    ///
    /// The block can only need to move toward the head.
    pub(crate) fn reposition_after_reserve(&mut self, arena: &mut BlockArena, id: BlockId) {
        let vacant = arena.get(id).vacant();
        let mut anchor = arena.get(id).free_list_links().prev;

        if anchor.is_none_or(|prev| arena.get(prev).vacant() <= vacant) {
            return;
        }

        while let Some(candidate) = anchor {
            if arena.get(candidate).vacant() <= vacant {
                break;
            }

            anchor = arena.get(candidate).free_list_links().prev;
        }

        self.remove(arena, id);
        self.link_after(arena, id, anchor);
    }

    /// Restores order after the vacant count of a listed block went up by one.
    ///
    /// The block can only need to move toward the tail.
    pub(crate) fn reposition_after_release(&mut self, arena: &mut BlockArena, id: BlockId) {
        let vacant = arena.get(id).vacant();
        let mut anchor = arena.get(id).free_list_links().next;

        if anchor.is_none_or(|next| arena.get(next).vacant() >= vacant) {
            return;
        }

        while let Some(candidate) = anchor {
            if arena.get(candidate).vacant() >= vacant {
                break;
            }

            anchor = arena.get(candidate).free_list_links().next;
        }

        self.remove(arena, id);
        self.link_before(arena, id, anchor);
    }

    /// Listed blocks from head to tail.
    pub(crate) fn iter<'a>(&self, arena: &'a BlockArena) -> impl Iterator<Item = BlockId> + 'a {
        iter::successors(self.head, move |id| arena.get(*id).free_list_links().next)
    }

    /// Listed blocks from tail to head.
    pub(crate) fn iter_rev<'a>(
        &self,
        arena: &'a BlockArena,
    ) -> impl Iterator<Item = BlockId> + 'a {
        iter::successors(self.tail, move |id| arena.get(*id).free_list_links().prev)
    }

    /// Links `id` directly after `anchor`, or at the head if there is no anchor.
    fn link_after(&mut self, arena: &mut BlockArena, id: BlockId, anchor: Option<BlockId>) {
        debug_assert!(!arena.get(id).free_list_links().listed);

        let next = match anchor {
            Some(anchor) => arena.get(anchor).free_list_links().next,
            None => self.head,
        };

        *arena.get_mut(id).free_list_links_mut() = FreeListLinks {
            listed: true,
            prev: anchor,
            next,
        };

        match anchor {
            Some(anchor) => arena.get_mut(anchor).free_list_links_mut().next = Some(id),
            None => self.head = Some(id),
        }

        match next {
            Some(next) => arena.get_mut(next).free_list_links_mut().prev = Some(id),
            None => self.tail = Some(id),
        }

        // Cannot wrap because that would imply more blocks than virtual memory.
        self.len = self.len.wrapping_add(1);
    }

    /// Links `id` directly before `anchor`, or at the tail if there is no anchor.
    fn link_before(&mut self, arena: &mut BlockArena, id: BlockId, anchor: Option<BlockId>) {
        let prev = match anchor {
            Some(anchor) => arena.get(anchor).free_list_links().prev,
            None => self.tail,
        };

        self.link_after(arena, id, prev);
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    pub(crate) fn integrity_check(&self, arena: &BlockArena) {
        let mut expected_prev = None;
        let mut previous_vacant = 0;
        let mut observed_len: usize = 0;

        for id in self.iter(arena) {
            let block = arena.get(id);
            let links = block.free_list_links();

            assert!(links.listed, "{id:?} is linked but not marked as listed");
            assert_eq!(links.prev, expected_prev, "{id:?} has a broken back link");
            assert!(block.vacant() > 0, "{id:?} is listed but has no vacant slots");
            assert!(
                block.vacant() >= previous_vacant,
                "{id:?} with {} vacant slots is listed after a block with {previous_vacant}",
                block.vacant()
            );

            expected_prev = Some(id);
            previous_vacant = block.vacant();
            observed_len = observed_len.wrapping_add(1);
        }

        assert_eq!(self.tail, expected_prev, "free-list tail does not match its last block");
        assert_eq!(self.len, observed_len, "free-list length does not match its links");
    }
}

#[cfg(test)]
#[allow(
    clippy::indexing_slicing,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::alloc::{Layout, System};

    use super::*;
    use crate::{Block, SlotLayout, allocate};

    const CAPACITY: usize = 8;

    fn slot_layout() -> SlotLayout {
        SlotLayout::calculate(Layout::from_size_align(12, 4).unwrap())
    }

    /// Registers a block of `CAPACITY` slots with `allocated` of them in use.
    fn add_block(arena: &mut BlockArena, allocated: usize) -> BlockId {
        let layout = slot_layout();
        let buffer = allocate(&System, CAPACITY * layout.stride(), layout.align()).unwrap();
        let carving = layout.carve(buffer.ptr(), buffer.len()).unwrap();
        let mut block = Block::new(buffer, carving, &layout, 0);

        for _ in 0..allocated {
            _ = block.reserve_slot(&layout);
        }

        arena.insert(block)
    }

    fn vacancies(list: &FreeList, arena: &BlockArena) -> Vec<usize> {
        list.iter(arena).map(|id| arena.get(id).vacant()).collect()
    }

    fn release_all(arena: &mut BlockArena) {
        for block in arena.drain() {
            block.into_detached().release(&System);
        }
    }

    #[test]
    fn empty_list_has_no_head() {
        let list = FreeList::new();

        assert_eq!(list.head(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn insert_keeps_ascending_order() {
        let mut arena = BlockArena::new();
        let mut list = FreeList::new();

        for allocated in [2, 7, 0, 5, 5] {
            let id = add_block(&mut arena, allocated);
            list.insert(&mut arena, id);
        }

        assert_eq!(vacancies(&list, &arena), vec![1, 3, 3, 6, 8]);
        assert_eq!(list.len(), 5);
        list.integrity_check(&arena);

        release_all(&mut arena);
    }

    #[test]
    fn equal_counts_keep_insertion_order() {
        let mut arena = BlockArena::new();
        let mut list = FreeList::new();

        let first = add_block(&mut arena, 3);
        let second = add_block(&mut arena, 3);
        list.insert(&mut arena, first);
        list.insert(&mut arena, second);

        assert_eq!(list.iter(&arena).collect::<Vec<_>>(), vec![first, second]);

        release_all(&mut arena);
    }

    #[test]
    fn remove_relinks_neighbors() {
        let mut arena = BlockArena::new();
        let mut list = FreeList::new();

        let ids: Vec<_> = [6, 4, 2]
            .into_iter()
            .map(|allocated| add_block(&mut arena, allocated))
            .collect();

        for id in &ids {
            list.insert(&mut arena, *id);
        }

        list.remove(&mut arena, ids[1]);
        assert!(!arena.get(ids[1]).free_list_links().is_listed());
        assert_eq!(vacancies(&list, &arena), vec![2, 6]);
        list.integrity_check(&arena);

        list.remove(&mut arena, ids[0]);
        list.remove(&mut arena, ids[2]);
        assert!(list.is_empty());
        assert_eq!(list.head(), None);
        list.integrity_check(&arena);

        release_all(&mut arena);
    }

    #[test]
    #[should_panic]
    fn remove_unlisted_panics() {
        let mut arena = BlockArena::new();
        let mut list = FreeList::new();
        let id = add_block(&mut arena, 0);

        list.remove(&mut arena, id);
    }

    #[test]
    fn reserve_moves_block_toward_head() {
        let layout = slot_layout();
        let mut arena = BlockArena::new();
        let mut list = FreeList::new();

        let a = add_block(&mut arena, 5); // 3 vacant
        let b = add_block(&mut arena, 4); // 4 vacant
        let c = add_block(&mut arena, 4); // 4 vacant
        for id in [a, b, c] {
            list.insert(&mut arena, id);
        }

        // c drops to 3 vacant: it belongs after a but before b.
        _ = arena.get_mut(c).reserve_slot(&layout);
        list.reposition_after_reserve(&mut arena, c);
        assert_eq!(list.iter(&arena).collect::<Vec<_>>(), vec![a, c, b]);

        // c drops to 2 vacant: it becomes the new head.
        _ = arena.get_mut(c).reserve_slot(&layout);
        list.reposition_after_reserve(&mut arena, c);
        assert_eq!(list.head(), Some(c));
        list.integrity_check(&arena);

        release_all(&mut arena);
    }

    #[test]
    fn release_moves_block_toward_tail() {
        let mut arena = BlockArena::new();
        let mut list = FreeList::new();

        let a = add_block(&mut arena, 6); // 2 vacant
        let b = add_block(&mut arena, 5); // 3 vacant
        let c = add_block(&mut arena, 4); // 4 vacant
        for id in [a, b, c] {
            list.insert(&mut arena, id);
        }

        // a grows to 3 vacant: it moves before b, which has the same count.
        arena.get_mut(a).release_slot(0);
        list.reposition_after_release(&mut arena, a);
        assert_eq!(list.iter(&arena).collect::<Vec<_>>(), vec![a, b, c]);

        // a grows to 4 vacant, then 5: it moves past b, then past c to the tail.
        arena.get_mut(a).release_slot(1);
        list.reposition_after_release(&mut arena, a);
        assert_eq!(list.iter(&arena).collect::<Vec<_>>(), vec![b, a, c]);

        arena.get_mut(a).release_slot(2);
        list.reposition_after_release(&mut arena, a);
        assert_eq!(list.iter(&arena).collect::<Vec<_>>(), vec![b, c, a]);
        assert_eq!(list.iter_rev(&arena).next(), Some(a));
        list.integrity_check(&arena);

        release_all(&mut arena);
    }

    #[test]
    fn first_vacancy_goes_to_head() {
        let mut arena = BlockArena::new();
        let mut list = FreeList::new();

        let partial = add_block(&mut arena, 6);
        list.insert(&mut arena, partial);

        let full = add_block(&mut arena, CAPACITY);
        arena.get_mut(full).release_slot(3);
        list.insert_first_vacancy(&mut arena, full);

        assert_eq!(list.head(), Some(full));
        assert_eq!(vacancies(&list, &arena), vec![1, 2]);
        list.integrity_check(&arena);

        release_all(&mut arena);
    }
}
