use crate::Block;

/// Stable handle of a block inside a [`BlockArena`].
///
/// Handles of released blocks are recycled, so a handle is only meaningful while the block it
/// was issued for is still registered.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct BlockId(usize);

/// Owns the metadata of every live block. The directory and the free-list refer to blocks
/// only by [`BlockId`], never by pointer.
#[derive(Debug, Default)]
pub(crate) struct BlockArena {
    entries: Vec<Option<Block>>,

    /// Indexes of `None` entries, reused before the vector grows.
    vacant_entries: Vec<usize>,

    len: usize,
}

impl BlockArena {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of live blocks.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn insert(&mut self, block: Block) -> BlockId {
        // Cannot wrap because that would imply more blocks than virtual memory.
        self.len = self.len.wrapping_add(1);

        if let Some(index) = self.vacant_entries.pop() {
            let entry = self
                .entries
                .get_mut(index)
                .expect("vacant entry indexes always refer to existing entries");

            debug_assert!(entry.is_none());
            *entry = Some(block);

            return BlockId(index);
        }

        self.entries.push(Some(block));

        // Cannot wrap because we just pushed an entry.
        BlockId(self.entries.len().wrapping_sub(1))
    }

    /// # Panics
    ///
    /// Panics if the handle does not refer to a live block.
    pub(crate) fn remove(&mut self, id: BlockId) -> Block {
        let block = self
            .entries
            .get_mut(id.0)
            .and_then(Option::take)
            .unwrap_or_else(|| panic!("{id:?} does not refer to a live block"));

        self.vacant_entries.push(id.0);

        // Cannot wrap because we just removed a live block.
        self.len = self.len.wrapping_sub(1);

        block
    }

    /// # Panics
    ///
    /// Panics if the handle does not refer to a live block.
    #[must_use]
    pub(crate) fn get(&self, id: BlockId) -> &Block {
        self.entries
            .get(id.0)
            .and_then(Option::as_ref)
            .unwrap_or_else(|| panic!("{id:?} does not refer to a live block"))
    }

    /// # Panics
    ///
    /// Panics if the handle does not refer to a live block.
    #[must_use]
    pub(crate) fn get_mut(&mut self, id: BlockId) -> &mut Block {
        self.entries
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("{id:?} does not refer to a live block"))
    }

    /// Removes every block, in no particular order.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Block> + '_ {
        self.vacant_entries.clear();
        self.len = 0;

        self.entries.drain(..).flatten()
    }
}

#[cfg(test)]
mod tests {
    use std::alloc::{Layout, System};

    use super::*;
    use crate::{SlotLayout, allocate};

    fn new_block() -> Block {
        let layout = SlotLayout::calculate(Layout::new::<u64>());
        let buffer = allocate(&System, 256, layout.align()).unwrap();
        let carving = layout.carve(buffer.ptr(), buffer.len()).unwrap();

        Block::new(buffer, carving, &layout, 0)
    }

    fn release_all(arena: &mut BlockArena) {
        for block in arena.drain() {
            block.into_detached().release(&System);
        }
    }

    #[test]
    fn insert_get_remove() {
        let mut arena = BlockArena::new();
        assert_eq!(arena.len(), 0);

        let a = arena.insert(new_block());
        let b = arena.insert(new_block());
        assert_ne!(a, b);
        assert_eq!(arena.len(), 2);

        assert!(arena.get(a).is_unused());
        assert!(arena.get_mut(b).is_unused());

        arena.remove(a).into_detached().release(&System);
        assert_eq!(arena.len(), 1);

        release_all(&mut arena);
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn removed_ids_are_recycled() {
        let mut arena = BlockArena::new();

        let a = arena.insert(new_block());
        arena.remove(a).into_detached().release(&System);

        let b = arena.insert(new_block());
        assert_eq!(a, b);

        release_all(&mut arena);
    }

    #[test]
    #[should_panic]
    fn get_removed_panics() {
        let mut arena = BlockArena::new();

        let a = arena.insert(new_block());
        arena.remove(a).into_detached().release(&System);

        _ = arena.get(a);
    }

    #[test]
    fn drain_yields_every_block() {
        let mut arena = BlockArena::new();

        let a = arena.insert(new_block());
        _ = arena.insert(new_block());
        _ = arena.insert(new_block());
        arena.remove(a).into_detached().release(&System);

        let drained: Vec<_> = arena.drain().collect();
        assert_eq!(drained.len(), 2);
        assert_eq!(arena.len(), 0);

        for block in drained {
            block.into_detached().release(&System);
        }
    }
}
