use crate::{BlockArena, BlockId, MAX_BUCKET_COUNT};

/// Partitions all live blocks into buckets so that an object pointer can be mapped back to its
/// block by scanning a single bucket.
///
/// Every object carries the index of its block's bucket in its slot header. New blocks go to
/// the least populated bucket, which keeps the buckets, and therefore the lookup cost, balanced.
///
/// Each bucket is ordered by descending end address, so a lookup can stop as soon as it passes
/// the address it is looking for.
#[derive(Debug)]
pub(crate) struct Directory {
    buckets: Box<[Vec<BlockId>]>,
}

impl Directory {
    /// # Panics
    ///
    /// Panics if `bucket_count` is zero or larger than a slot header can record.
    #[must_use]
    pub(crate) fn new(bucket_count: usize) -> Self {
        assert!(
            (1..=MAX_BUCKET_COUNT).contains(&bucket_count),
            "bucket count must be in 1..={MAX_BUCKET_COUNT}, got {bucket_count}"
        );

        Self {
            buckets: (0..bucket_count).map(|_| Vec::new()).collect(),
        }
    }

    #[must_use]
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// The bucket a new block should be assigned to: the one with the fewest blocks, the lowest
    /// index winning ties.
    #[must_use]
    pub(crate) fn least_loaded(&self) -> usize {
        (0..self.buckets.len())
            .min_by_key(|index| self.bucket_len(*index))
            .expect("a directory always has at least one bucket")
    }

    /// Number of blocks in bucket `index`.
    #[must_use]
    pub(crate) fn bucket_len(&self, index: usize) -> usize {
        self.buckets.get(index).map_or(0, Vec::len)
    }

    #[must_use]
    pub(crate) fn block_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Registers a block in the bucket it was created for.
    ///
    /// # Panics
    ///
    /// Panics if the block refers to a bucket this directory does not have.
    pub(crate) fn insert(&mut self, arena: &BlockArena, id: BlockId) {
        let block = arena.get(id);
        let end = block.end_addr();

        let bucket = self
            .buckets
            .get_mut(block.bucket())
            .unwrap_or_else(|| panic!("{id:?} was created for a bucket that does not exist"));

        let position = bucket.partition_point(|other| arena.get(*other).end_addr() > end);
        bucket.insert(position, id);
    }

    /// # Panics
    ///
    /// Panics if the block is not registered.
    pub(crate) fn remove(&mut self, arena: &BlockArena, id: BlockId) {
        let bucket = self
            .buckets
            .get_mut(arena.get(id).bucket())
            .unwrap_or_else(|| panic!("{id:?} was created for a bucket that does not exist"));

        let position = bucket
            .iter()
            .position(|candidate| *candidate == id)
            .unwrap_or_else(|| panic!("{id:?} is not registered in the directory"));

        bucket.remove(position);
    }

    /// Finds the block of `bucket` whose slots contain `addr`.
    ///
    /// Returns `None` if the bucket does not exist or no block in it contains the address.
    #[must_use]
    pub(crate) fn resolve(
        &self,
        arena: &BlockArena,
        bucket: usize,
        addr: usize,
    ) -> Option<BlockId> {
        for id in self.buckets.get(bucket)? {
            let block = arena.get(*id);

            if addr >= block.end_addr() {
                // Every remaining block ends even earlier.
                return None;
            }

            if block.contains(addr) {
                return Some(*id);
            }
        }

        None
    }

    /// Every registered block, bucket by bucket.
    pub(crate) fn iter(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.buckets.iter().flatten().copied()
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    pub(crate) fn integrity_check(&self, arena: &BlockArena) {
        assert_eq!(
            self.block_count(),
            arena.len(),
            "directory does not account for every block"
        );

        for (index, bucket) in self.buckets.iter().enumerate() {
            let mut previous_start = None;

            for id in bucket {
                let block = arena.get(*id);

                assert_eq!(block.bucket(), index, "{id:?} is registered in the wrong bucket");

                if let Some(previous_start) = previous_start {
                    assert!(
                        block.end_addr() <= previous_start,
                        "{id:?} overlaps or is out of order in bucket {index}"
                    );
                }

                previous_start = Some(block.start_addr());
            }
        }
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

    fn add_block(directory: &mut Directory, arena: &mut BlockArena) -> BlockId {
        let layout = SlotLayout::calculate(Layout::from_size_align(12, 4).unwrap());
        let buffer = allocate(&System, 8 * layout.stride(), layout.align()).unwrap();
        let carving = layout.carve(buffer.ptr(), buffer.len()).unwrap();
        let block = Block::new(buffer, carving, &layout, directory.least_loaded());

        let id = arena.insert(block);
        directory.insert(arena, id);
        id
    }

    fn release_all(arena: &mut BlockArena) {
        for block in arena.drain() {
            block.into_detached().release(&System);
        }
    }

    #[test]
    fn new_blocks_are_spread_over_buckets() {
        let mut directory = Directory::new(3);
        let mut arena = BlockArena::new();

        let buckets: Vec<_> = (0..7)
            .map(|_| arena_bucket(&mut directory, &mut arena))
            .collect();

        assert_eq!(buckets, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(directory.bucket_len(0), 3);
        assert_eq!(directory.bucket_len(1), 2);
        assert_eq!(directory.block_count(), 7);
        directory.integrity_check(&arena);

        release_all(&mut arena);
    }

    fn arena_bucket(directory: &mut Directory, arena: &mut BlockArena) -> usize {
        let id = add_block(directory, arena);
        arena.get(id).bucket()
    }

    #[test]
    fn least_loaded_refills_emptied_bucket() {
        let mut directory = Directory::new(3);
        let mut arena = BlockArena::new();

        let ids: Vec<_> = (0..3).map(|_| add_block(&mut directory, &mut arena)).collect();

        directory.remove(&arena, ids[1]);
        arena.remove(ids[1]).into_detached().release(&System);

        assert_eq!(directory.least_loaded(), 1);
        directory.integrity_check(&arena);

        release_all(&mut arena);
    }

    #[test]
    fn resolve_finds_owner_of_every_slot() {
        let mut directory = Directory::new(2);
        let mut arena = BlockArena::new();

        let ids: Vec<_> = (0..6).map(|_| add_block(&mut directory, &mut arena)).collect();

        for id in ids {
            let block = arena.get(id);

            for addr in [block.start_addr(), block.end_addr() - 1] {
                assert_eq!(directory.resolve(&arena, block.bucket(), addr), Some(id));
            }
        }

        release_all(&mut arena);
    }

    #[test]
    fn resolve_foreign_address_is_none() {
        let mut directory = Directory::new(2);
        let mut arena = BlockArena::new();

        let id = add_block(&mut directory, &mut arena);
        let block = arena.get(id);

        // Right bucket, wrong address.
        assert_eq!(directory.resolve(&arena, 0, block.end_addr()), None);
        assert_eq!(directory.resolve(&arena, 0, block.start_addr() - 1), None);

        // Right address, wrong bucket.
        assert_eq!(directory.resolve(&arena, 1, block.start_addr()), None);

        // Bucket that does not exist.
        assert_eq!(directory.resolve(&arena, 99, block.start_addr()), None);

        release_all(&mut arena);
    }

    #[test]
    fn buckets_are_ordered_by_descending_end() {
        let mut directory = Directory::new(1);
        let mut arena = BlockArena::new();

        for _ in 0..5 {
            _ = add_block(&mut directory, &mut arena);
        }

        let ends: Vec<_> = directory.iter().map(|id| arena.get(id).end_addr()).collect();
        assert!(ends.windows(2).all(|pair| pair[0] > pair[1]));
        directory.integrity_check(&arena);

        release_all(&mut arena);
    }

    #[test]
    #[should_panic]
    fn zero_buckets_panics() {
        _ = Directory::new(0);
    }

    #[test]
    #[should_panic]
    fn too_many_buckets_panics() {
        _ = Directory::new(MAX_BUCKET_COUNT + 1);
    }

    #[test]
    #[should_panic]
    fn remove_unregistered_panics() {
        let mut directory = Directory::new(1);
        let mut arena = BlockArena::new();

        let id = add_block(&mut directory, &mut arena);
        directory.remove(&arena, id);
        directory.remove(&arena, id);
    }
}
