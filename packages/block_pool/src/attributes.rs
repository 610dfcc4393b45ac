/// Policy settings of a [`BlockPool`][crate::BlockPool] that may be changed at runtime.
///
/// Changes only affect decisions made afterwards: how large new blocks are and whether a
/// drained block is kept. Existing blocks are never resized.
///
/// # Examples
///
/// ```
/// use block_pool::{BlockPool, PoolAttributes};
///
/// let pool = BlockPool::new(24);
///
/// pool.set_attributes(
///     PoolAttributes::new()
///         .with_growth_granularity(4096)
///         .with_min_cached_objects(0)
///         .with_max_allocations(Some(1000)),
/// );
///
/// assert_eq!(pool.attributes().max_allocations(), Some(1000));
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolAttributes {
    growth_granularity: usize,
    min_cached_objects: usize,
    max_allocations: Option<usize>,
}

impl PoolAttributes {
    /// Smallest accepted growth granularity, in bytes. Smaller values are raised to this.
    pub const MIN_GROWTH_GRANULARITY: usize = 4096;

    /// Growth granularity of a new pool, in bytes.
    pub const DEFAULT_GROWTH_GRANULARITY: usize = 8192;

    /// Number of vacant slots a new pool keeps before it starts releasing drained blocks.
    pub const DEFAULT_MIN_CACHED_OBJECTS: usize = 15;

    /// The attributes every new pool starts with.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            growth_granularity: Self::DEFAULT_GROWTH_GRANULARITY,
            min_cached_objects: Self::DEFAULT_MIN_CACHED_OBJECTS,
            max_allocations: None,
        }
    }

    /// Sets the unit new blocks are sized in, in bytes.
    ///
    /// Values below [`MIN_GROWTH_GRANULARITY`](Self::MIN_GROWTH_GRANULARITY) are raised to it.
    #[must_use]
    pub const fn with_growth_granularity(mut self, bytes: usize) -> Self {
        self.growth_granularity = if bytes < Self::MIN_GROWTH_GRANULARITY {
            Self::MIN_GROWTH_GRANULARITY
        } else {
            bytes
        };
        self
    }

    /// Sets how many vacant slots the pool keeps across all blocks before a block that becomes
    /// entirely vacant is released. Also the minimum number of slots a new block is sized for.
    #[must_use]
    pub const fn with_min_cached_objects(mut self, objects: usize) -> Self {
        self.min_cached_objects = objects;
        self
    }

    /// Sets the maximum number of concurrently allocated objects. `None` means unlimited.
    #[must_use]
    pub const fn with_max_allocations(mut self, limit: Option<usize>) -> Self {
        self.max_allocations = limit;
        self
    }

    /// The unit new blocks are sized in, in bytes.
    #[must_use]
    pub const fn growth_granularity(&self) -> usize {
        self.growth_granularity
    }

    /// How many vacant slots the pool keeps before releasing drained blocks.
    #[must_use]
    pub const fn min_cached_objects(&self) -> usize {
        self.min_cached_objects
    }

    /// The maximum number of concurrently allocated objects, if limited.
    #[must_use]
    pub const fn max_allocations(&self) -> Option<usize> {
        self.max_allocations
    }

    /// Length of the buffer for a new block with slots of `stride` bytes.
    ///
    /// Large enough for at least one slot and for the configured number of cached objects,
    /// rounded up to a multiple of the growth granularity. Returns `None` on overflow.
    #[must_use]
    pub(crate) fn block_len(&self, stride: usize) -> Option<usize> {
        let wanted = stride.checked_mul(self.min_cached_objects.max(1))?;

        wanted.checked_next_multiple_of(self.growth_granularity)
    }

    /// Whether the pool with `total_vacant` vacant slots would still have enough of them left
    /// after giving up a drained block of `block_capacity` slots.
    #[must_use]
    pub(crate) fn allows_release(&self, total_vacant: usize, block_capacity: usize) -> bool {
        total_vacant
            .checked_sub(block_capacity)
            .is_some_and(|remaining| remaining >= self.min_cached_objects)
    }
}

impl Default for PoolAttributes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let attributes = PoolAttributes::default();

        assert_eq!(attributes.growth_granularity(), 8192);
        assert_eq!(attributes.min_cached_objects(), 15);
        assert_eq!(attributes.max_allocations(), None);
    }

    #[test]
    fn growth_granularity_is_clamped() {
        let attributes = PoolAttributes::new().with_growth_granularity(100);
        assert_eq!(attributes.growth_granularity(), 4096);

        let attributes = PoolAttributes::new().with_growth_granularity(0);
        assert_eq!(attributes.growth_granularity(), 4096);

        let attributes = PoolAttributes::new().with_growth_granularity(5000);
        assert_eq!(attributes.growth_granularity(), 5000);
    }

    #[test]
    fn block_len_is_one_granule_for_small_caches() {
        let attributes = PoolAttributes::new()
            .with_growth_granularity(4096)
            .with_min_cached_objects(0);

        assert_eq!(attributes.block_len(28), Some(4096));
    }

    #[test]
    fn block_len_grows_for_large_caches() {
        let attributes = PoolAttributes::new()
            .with_growth_granularity(4096)
            .with_min_cached_objects(200);

        // 200 * 28 = 5600, rounded up to two granules.
        assert_eq!(attributes.block_len(28), Some(8192));
    }

    #[test]
    fn block_len_fits_oversized_object() {
        let attributes = PoolAttributes::new()
            .with_growth_granularity(4096)
            .with_min_cached_objects(0);

        assert_eq!(attributes.block_len(10_000), Some(12288));
    }

    #[test]
    fn block_len_overflow_is_none() {
        let attributes = PoolAttributes::new().with_min_cached_objects(usize::MAX);

        assert_eq!(attributes.block_len(28), None);
    }

    #[test]
    fn release_requires_enough_remaining_vacancies() {
        let attributes = PoolAttributes::new().with_min_cached_objects(10);

        assert!(attributes.allows_release(160, 146));
        assert!(attributes.allows_release(156, 146));
        assert!(!attributes.allows_release(155, 146));

        let attributes = PoolAttributes::new().with_min_cached_objects(0);
        assert!(attributes.allows_release(146, 146));
    }
}
