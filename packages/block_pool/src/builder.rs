use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::{Backing, BlockPool, DropPolicy, MAX_BUCKET_COUNT, PoolAttributes};

/// Alignment used for objects whose size is given via [`BlockPoolBuilder::object_size()`].
const DEFAULT_OBJECT_ALIGN: usize = 4;

/// Number of directory buckets of a pool unless configured otherwise.
const DEFAULT_BUCKET_COUNT: usize = 25;

/// Builder for creating an instance of [`BlockPool`].
///
/// [`BlockPool`] requires the object memory layout to be specified at construction time.
/// Use `.object_size()` to give a plain size, `.layout()` to provide a specific layout or
/// `.layout_of::<T>()` to generate a layout based on the provided type.
///
/// The layout is mandatory, whereas other settings are optional.
///
/// # Examples
///
/// ```
/// use block_pool::{BlockPool, PoolAttributes};
///
/// let pool = BlockPool::builder()
///     .object_size(24)
///     .attributes(PoolAttributes::new().with_min_cached_objects(0))
///     .bucket_count(8)
///     .build();
///
/// assert_eq!(pool.stats().object_size(), 28);
/// ```
///
/// Using type-based layout:
///
/// ```
/// use block_pool::BlockPool;
///
/// let pool = BlockPool::builder().layout_of::<u64>().build();
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing pool configuration to happen on different threads than where the pool is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[must_use]
pub struct BlockPoolBuilder {
    object_layout: Option<Layout>,
    attributes: PoolAttributes,
    bucket_count: usize,
    drop_policy: DropPolicy,
    backing: Option<Arc<Backing>>,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl BlockPoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            object_layout: None,
            attributes: PoolAttributes::default(),
            bucket_count: DEFAULT_BUCKET_COUNT,
            drop_policy: DropPolicy::default(),
            backing: None,
            _not_sync: PhantomData,
        }
    }

    /// Sets the size of the objects handed out by the pool, in bytes.
    ///
    /// Objects are aligned to 4 bytes. Use [`layout()`](Self::layout) for other alignments.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or too large to form a valid layout.
    pub fn object_size(self, size: usize) -> Self {
        let layout = Layout::from_size_align(size, DEFAULT_OBJECT_ALIGN)
            .expect("object size must not exceed isize::MAX when rounded up to 4 bytes");

        self.layout(layout)
    }

    /// Sets the memory layout of the objects handed out by the pool.
    ///
    /// # Panics
    ///
    /// Panics if the layout has zero size.
    pub fn layout(mut self, layout: Layout) -> Self {
        assert!(layout.size() > 0, "BlockPool must have non-zero object size");
        self.object_layout = Some(layout);
        self
    }

    /// Sets the memory layout of the objects handed out by the pool based on a type.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    pub fn layout_of<T>(self) -> Self {
        self.layout(Layout::new::<T>())
    }

    /// Sets the initial [attributes][PoolAttributes]. They can be changed later via
    /// [`BlockPool::set_attributes()`].
    pub fn attributes(mut self, attributes: PoolAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Sets the number of directory buckets the blocks are spread over. More buckets make
    /// deallocation cheaper when the pool holds many blocks. Defaults to 25.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero or greater than 128.
    pub fn bucket_count(mut self, count: usize) -> Self {
        assert!(
            (1..=MAX_BUCKET_COUNT).contains(&count),
            "bucket count must be in 1..={MAX_BUCKET_COUNT}, got {count}"
        );

        self.bucket_count = count;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the pool. This governs how to treat objects that
    /// are still allocated when the pool is dropped.
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Sets the allocator that supplies block memory. Defaults to [`System`].
    ///
    /// # Examples
    ///
    /// ```
    /// use std::alloc::System;
    ///
    /// use block_pool::BlockPool;
    ///
    /// let pool = BlockPool::builder()
    ///     .object_size(64)
    ///     .backing_allocator(System)
    ///     .build();
    /// ```
    pub fn backing_allocator<A>(mut self, allocator: A) -> Self
    where
        A: GlobalAlloc + Send + Sync + 'static,
    {
        self.backing = Some(Arc::new(allocator));
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if no layout has been set using [`object_size()`](Self::object_size),
    /// [`layout()`](Self::layout) or [`layout_of()`](Self::layout_of).
    #[must_use]
    pub fn build(self) -> BlockPool {
        let layout = self.object_layout.expect(
            "object layout must be set with .object_size(), .layout() or .layout_of::<T>()",
        );

        BlockPool::new_inner(
            layout,
            self.attributes,
            self.bucket_count,
            self.drop_policy,
            self.backing.unwrap_or_else(|| Arc::new(System)),
        )
    }
}

impl fmt::Debug for BlockPoolBuilder {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPoolBuilder")
            .field("object_layout", &self.object_layout)
            .field("attributes", &self.attributes)
            .field("bucket_count", &self.bucket_count)
            .field("drop_policy", &self.drop_policy)
            .field("custom_backing", &self.backing.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(BlockPoolBuilder: Send, fmt::Debug);
    assert_not_impl_any!(BlockPoolBuilder: Sync);

    #[test]
    fn object_size_uses_four_byte_alignment() {
        let pool = BlockPool::builder().object_size(24).build();

        assert_eq!(pool.object_layout(), Layout::from_size_align(24, 4).unwrap());
        assert_eq!(pool.stats().object_size(), 28);
    }

    #[test]
    fn layout_of_type() {
        let pool = BlockPool::builder().layout_of::<u128>().build();

        assert_eq!(pool.object_layout(), Layout::new::<u128>());
    }

    #[test]
    fn attributes_are_applied() {
        let attributes = PoolAttributes::new()
            .with_growth_granularity(16384)
            .with_max_allocations(Some(3));

        let pool = BlockPool::builder()
            .object_size(8)
            .attributes(attributes)
            .build();

        assert_eq!(pool.attributes(), attributes);
    }

    #[test]
    #[should_panic]
    fn build_without_layout_panics() {
        _ = BlockPool::builder().build();
    }

    #[test]
    #[should_panic]
    fn zero_object_size_panics() {
        _ = BlockPool::builder().object_size(0);
    }

    #[test]
    #[should_panic]
    fn zero_sized_type_panics() {
        _ = BlockPool::builder().layout_of::<()>();
    }

    #[test]
    #[should_panic]
    fn zero_buckets_panics() {
        _ = BlockPool::builder().bucket_count(0);
    }

    #[test]
    #[should_panic]
    fn too_many_buckets_panics() {
        _ = BlockPool::builder().bucket_count(129);
    }

    #[test]
    fn max_bucket_count_is_accepted() {
        let pool = BlockPool::builder()
            .object_size(8)
            .bucket_count(MAX_BUCKET_COUNT)
            .build();

        assert_eq!(pool.bucket_count(), MAX_BUCKET_COUNT);
    }
}
