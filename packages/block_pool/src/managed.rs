use std::alloc::Layout;
use std::ops::ControlFlow;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::{BlockPool, BlockStats, PoolAttributes, PoolStats, Result};

/// A cloneable, reference-counted handle to a shared [`BlockPool`].
///
/// Cloning the handle adds a reference, dropping it removes one. The pool itself is dropped,
/// according to its [drop policy][crate::DropPolicy], together with the last handle.
///
/// # Thread Safety
///
/// This type is thread-safe and can be safely shared across multiple threads.
///
/// # Example
///
/// ```rust
/// use std::thread;
///
/// use block_pool::{BlockPool, ManagedBlockPool};
///
/// let pool = ManagedBlockPool::from(BlockPool::new(32));
///
/// // Clone the pool handle to share across threads.
/// let pool_clone = pool.clone();
/// assert_eq!(pool.ref_count(), 2);
///
/// let handle = thread::spawn(move || {
///     let object = pool_clone.alloc().unwrap();
///     // SAFETY: The object came from this pool and is deallocated once.
///     unsafe { pool_clone.dealloc(object) };
/// });
///
/// handle.join().unwrap();
/// assert_eq!(pool.ref_count(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct ManagedBlockPool {
    inner: Arc<BlockPool>,
}

impl From<BlockPool> for ManagedBlockPool {
    fn from(pool: BlockPool) -> Self {
        Self {
            inner: Arc::new(pool),
        }
    }
}

impl ManagedBlockPool {
    /// Creates a handle to a new, empty pool with the same object layout, bucket count, drop
    /// policy and backing allocator as this one, but with default attributes.
    ///
    /// # Example
    ///
    /// ```rust
    /// use block_pool::{BlockPool, ManagedBlockPool, PoolAttributes};
    ///
    /// let pool = ManagedBlockPool::from(BlockPool::new(32));
    /// pool.set_attributes(PoolAttributes::new().with_min_cached_objects(0));
    ///
    /// let fresh = pool.clone_fresh();
    ///
    /// assert_eq!(fresh.object_layout(), pool.object_layout());
    /// assert_eq!(fresh.attributes(), PoolAttributes::default());
    /// assert_eq!(fresh.ref_count(), 1);
    /// ```
    #[must_use]
    pub fn clone_fresh(&self) -> Self {
        Self::from(self.inner.fresh())
    }

    /// Number of handles referring to the same pool, this one included.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// The shared pool.
    #[must_use]
    pub fn pool(&self) -> &BlockPool {
        &self.inner
    }

    /// See [`BlockPool::object_layout()`].
    #[must_use]
    pub fn object_layout(&self) -> Layout {
        self.inner.object_layout()
    }

    /// See [`BlockPool::alloc()`].
    ///
    /// # Errors
    ///
    /// Same as [`BlockPool::alloc()`].
    pub fn alloc(&self) -> Result<NonNull<u8>> {
        self.inner.alloc()
    }

    /// See [`BlockPool::dealloc()`].
    ///
    /// # Safety
    ///
    /// Same as [`BlockPool::dealloc()`]. Objects allocated through any handle of the same pool
    /// may be deallocated through any other.
    pub unsafe fn dealloc(&self, object: NonNull<u8>) {
        // SAFETY: Forwarding the guarantees from the caller.
        unsafe { self.inner.dealloc(object) }
    }

    /// See [`BlockPool::flush()`].
    pub fn flush(&self) -> usize {
        self.inner.flush()
    }

    /// See [`BlockPool::attributes()`].
    #[must_use]
    pub fn attributes(&self) -> PoolAttributes {
        self.inner.attributes()
    }

    /// See [`BlockPool::set_attributes()`].
    pub fn set_attributes(&self, attributes: PoolAttributes) {
        self.inner.set_attributes(attributes);
    }

    /// See [`BlockPool::stats()`].
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    /// See [`BlockPool::walk_blocks()`].
    pub fn walk_blocks(&self, visit: impl FnMut(&BlockStats) -> ControlFlow<()>) -> usize {
        self.inner.walk_blocks(visit)
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ManagedBlockPool: Send, Sync, Clone);

    #[test]
    fn clones_share_one_pool() {
        let pool = ManagedBlockPool::from(BlockPool::new(16));
        let clone = pool.clone();

        let object = pool.alloc().unwrap();
        assert_eq!(clone.stats().objects_allocated(), 1);

        // SAFETY: Allocated from the same pool above.
        unsafe { clone.dealloc(object) };
        assert_eq!(pool.stats().objects_allocated(), 0);

        assert!(ptr::eq(pool.pool(), clone.pool()));
    }

    #[test]
    fn ref_count_follows_handles() {
        let pool = ManagedBlockPool::from(BlockPool::new(16));
        assert_eq!(pool.ref_count(), 1);

        let clone = pool.clone();
        assert_eq!(pool.ref_count(), 2);

        drop(clone);
        assert_eq!(pool.ref_count(), 1);
    }

    #[test]
    fn clone_fresh_is_independent() {
        let pool = ManagedBlockPool::from(BlockPool::new(16));
        pool.set_attributes(pool.attributes().with_max_allocations(Some(1)));

        let fresh = pool.clone_fresh();

        let object = fresh.alloc().unwrap();
        assert_eq!(pool.stats().objects_acquired(), 0);
        assert_eq!(fresh.attributes().max_allocations(), None);
        assert_eq!(pool.ref_count(), 1);

        // SAFETY: Allocated from this pool above.
        unsafe { fresh.dealloc(object) };
    }

    #[test]
    fn attributes_and_flush_are_forwarded() {
        let pool = ManagedBlockPool::from(BlockPool::new(16));

        let object = pool.alloc().unwrap();
        // SAFETY: Allocated from this pool above.
        unsafe { pool.dealloc(object) };

        // The default attributes keep the drained block, flush releases it.
        assert_eq!(pool.walk_blocks(|_| ControlFlow::Continue(())), 1);
        assert_eq!(pool.flush(), 1);
        assert_eq!(pool.stats().block_count(), 0);
    }
}
