use std::fmt;
use std::ptr::NonNull;

/// Point-in-time snapshot of the state of a [`BlockPool`][crate::BlockPool].
///
/// The [`Display`][fmt::Display] implementation renders the snapshot as a few lines of
/// `name: value` text, intended for diagnostics.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    bytes_held: usize,
    object_size: usize,
    objects_cached: usize,
    objects_allocated: usize,
    objects_acquired: u64,
    block_count: usize,
}

impl PoolStats {
    pub(crate) fn new(object_size: usize, objects_acquired: u64) -> Self {
        Self {
            object_size,
            objects_acquired,
            ..Self::default()
        }
    }

    /// Adds one block to the totals.
    pub(crate) fn add_block(&mut self, block: &BlockStats) {
        // Cannot overflow because the sums are bounded by the size of the address space.
        self.bytes_held = self.bytes_held.wrapping_add(block.len());
        self.objects_cached = self.objects_cached.wrapping_add(block.objects_cached());
        self.objects_allocated = self
            .objects_allocated
            .wrapping_add(block.objects_allocated());
        self.block_count = self.block_count.wrapping_add(1);
    }

    /// Total length of the buffers of all blocks, in bytes.
    #[must_use]
    pub fn bytes_held(&self) -> usize {
        self.bytes_held
    }

    /// Bytes each object occupies inside a block, including its slot header and padding.
    #[must_use]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Number of vacant slots across all blocks.
    #[must_use]
    pub fn objects_cached(&self) -> usize {
        self.objects_cached
    }

    /// Number of objects currently allocated.
    #[must_use]
    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated
    }

    /// Number of allocation requests made over the lifetime of the pool, including failed ones.
    #[must_use]
    pub fn objects_acquired(&self) -> u64 {
        self.objects_acquired
    }

    /// Number of blocks the pool holds.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.block_count
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "bytes_held: {} bytes", self.bytes_held)?;
        writeln!(f, "object_size: {} bytes", self.object_size)?;
        writeln!(f, "objects_cached: {}", self.objects_cached)?;
        writeln!(f, "objects_allocated: {}", self.objects_allocated)?;
        writeln!(f, "objects_acquired: {}", self.objects_acquired)?;
        writeln!(f, "block_count: {}", self.block_count)
    }
}

/// Snapshot of a single block, passed to the callback of
/// [`BlockPool::walk_blocks()`][crate::BlockPool::walk_blocks].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockStats {
    base: NonNull<u8>,
    len: usize,
    objects_cached: usize,
    objects_allocated: usize,
}

impl BlockStats {
    pub(crate) fn new(
        base: NonNull<u8>,
        len: usize,
        objects_cached: usize,
        objects_allocated: usize,
    ) -> Self {
        Self {
            base,
            len,
            objects_cached,
            objects_allocated,
        }
    }

    /// Start of the buffer the block was built from.
    ///
    /// Only meaningful as an address; the memory belongs to the pool.
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Length of the buffer the block was built from, in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer has zero length. Never true for a registered block.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of vacant slots in the block.
    #[must_use]
    pub fn objects_cached(&self) -> usize {
        self.objects_cached
    }

    /// Number of allocated slots in the block.
    #[must_use]
    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(PoolStats: Send, Sync, Copy, fmt::Display);

    #[test]
    fn totals_sum_over_blocks() {
        let mut storage = [0_u8; 2];
        let base = NonNull::from(&mut storage).cast::<u8>();

        let mut stats = PoolStats::new(28, 9);
        stats.add_block(&BlockStats::new(base, 4096, 140, 6));
        stats.add_block(&BlockStats::new(base, 8192, 292, 0));

        assert_eq!(stats.bytes_held(), 12288);
        assert_eq!(stats.object_size(), 28);
        assert_eq!(stats.objects_cached(), 432);
        assert_eq!(stats.objects_allocated(), 6);
        assert_eq!(stats.objects_acquired(), 9);
        assert_eq!(stats.block_count(), 2);
    }

    #[test]
    fn display_lists_every_counter() {
        let mut storage = [0_u8; 2];
        let base = NonNull::from(&mut storage).cast::<u8>();

        let mut stats = PoolStats::new(28, 3);
        stats.add_block(&BlockStats::new(base, 4096, 143, 3));

        assert_eq!(
            stats.to_string(),
            "bytes_held: 4096 bytes\n\
             object_size: 28 bytes\n\
             objects_cached: 143\n\
             objects_allocated: 3\n\
             objects_acquired: 3\n\
             block_count: 1\n"
        );
    }
}
