use std::alloc::Layout;
use std::ops::ControlFlow;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::{fmt, thread};

use tracing::{debug, trace, warn};

use crate::constants::ERR_POISONED_LOCK;
use crate::{
    Backing, Block, BlockArena, BlockId, BlockPoolBuilder, BlockStats, Carving, DetachedBuffer,
    Directory, DropPolicy, Error, ExternalBuffer, FreeList, PoolAttributes, PoolBusy, PoolStats,
    Result, SlotHeader, SlotLayout, allocate,
};

/// A thread-safe pool of fixed-size memory slots, carved out of larger blocks obtained from a
/// backing allocator.
///
/// Every object handed out by [`alloc()`](Self::alloc) has the layout the pool was built with.
/// The memory is uninitialized from the caller's point of view and the pool never looks at it,
/// so it may hold anything that fits the layout.
///
/// # Allocation strategy
///
/// Allocations are served from the block that is closest to being full. This keeps live objects
/// packed together and lets lightly used blocks drain. Once a block has no allocated objects
/// left, it is given back to the backing allocator, unless the pool would then have fewer vacant
/// slots than [`PoolAttributes::min_cached_objects()`] asks for.
///
/// # Thread safety
///
/// All operations take `&self` and are serialized by a single lock per pool. The backing
/// allocator is only ever called with the lock released.
///
/// # Examples
///
/// ```
/// use block_pool::BlockPool;
///
/// let pool = BlockPool::new(24);
///
/// let object = pool.alloc().unwrap();
///
/// // SAFETY: The pool hands out 24 bytes aligned to 4 bytes, enough for a u32.
/// unsafe { object.cast::<u32>().write(42) };
///
/// // SAFETY: The object came from this pool and is deallocated once.
/// unsafe { pool.dealloc(object) };
///
/// assert_eq!(pool.stats().objects_allocated(), 0);
/// ```
pub struct BlockPool {
    slot_layout: SlotLayout,
    bucket_count: usize,
    drop_policy: DropPolicy,
    backing: Arc<Backing>,

    state: Mutex<PoolState>,
}

/// Everything guarded by the pool lock.
#[derive(Debug)]
struct PoolState {
    attributes: PoolAttributes,

    arena: BlockArena,
    directory: Directory,
    free_list: FreeList,

    /// Vacant slots across all blocks.
    total_vacant: usize,

    /// Allocated objects across all blocks.
    total_allocated: usize,

    /// Allocation requests over the lifetime of the pool, failed ones included.
    acquired: u64,
}

impl BlockPool {
    /// Creates a builder for configuring and constructing a [`BlockPool`].
    pub fn builder() -> BlockPoolBuilder {
        BlockPoolBuilder::new()
    }

    /// Creates a pool for objects of `object_size` bytes, aligned to 4 bytes, with default
    /// attributes.
    ///
    /// # Panics
    ///
    /// Panics if `object_size` is zero.
    #[must_use]
    pub fn new(object_size: usize) -> Self {
        Self::builder().object_size(object_size).build()
    }

    pub(crate) fn new_inner(
        object_layout: Layout,
        attributes: PoolAttributes,
        bucket_count: usize,
        drop_policy: DropPolicy,
        backing: Arc<Backing>,
    ) -> Self {
        let slot_layout = SlotLayout::calculate(object_layout);

        Self {
            slot_layout,
            bucket_count,
            drop_policy,
            backing,
            state: Mutex::new(PoolState {
                attributes,
                arena: BlockArena::new(),
                directory: Directory::new(bucket_count),
                free_list: FreeList::new(),
                total_vacant: 0,
                total_allocated: 0,
                acquired: 0,
            }),
        }
    }

    /// Creates an empty pool with the same object layout, bucket count, drop policy and backing
    /// allocator as this one but with default attributes.
    pub(crate) fn fresh(&self) -> Self {
        Self::new_inner(
            self.slot_layout.object_layout(),
            PoolAttributes::default(),
            self.bucket_count,
            self.drop_policy,
            Arc::clone(&self.backing),
        )
    }

    /// The layout of the objects handed out by the pool.
    #[must_use]
    pub fn object_layout(&self) -> Layout {
        self.slot_layout.object_layout()
    }

    /// The number of directory buckets the blocks are spread over.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// The current attributes.
    #[must_use]
    pub fn attributes(&self) -> PoolAttributes {
        self.lock().attributes
    }

    /// Replaces the attributes.
    ///
    /// Existing blocks are left alone. The new values apply to blocks created from now on and
    /// to blocks that drain from now on.
    pub fn set_attributes(&self, attributes: PoolAttributes) {
        self.lock().attributes = attributes;
    }

    /// Allocates one object.
    ///
    /// Creates a new block if no existing block has a vacant slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Throttled`] if the configured maximum number of allocated objects has
    /// been reached, and [`Error::OutOfMemory`] if a new block was needed but the backing
    /// allocator could not supply it. The pool is unchanged in both cases, except for the
    /// count of allocation requests.
    pub fn alloc(&self) -> Result<NonNull<u8>> {
        let mut state = self.lock();

        // Cannot realistically wrap, there is one increment per call.
        state.acquired = state.acquired.wrapping_add(1);

        if let Some(limit) = state.throttle_limit() {
            trace!(limit, "allocation throttled");
            return Err(Error::Throttled { limit });
        }

        if let Some(object) = state.reserve(&self.slot_layout) {
            if cfg!(debug_assertions) {
                state.integrity_check();
            }

            return Ok(object);
        }

        let Some(len) = state.attributes.block_len(self.slot_layout.stride()) else {
            warn!(
                stride = self.slot_layout.stride(),
                "block size for the configured attributes overflows"
            );
            return Err(Error::OutOfMemory { size: usize::MAX });
        };

        drop(state);

        let buffer = allocate(&*self.backing, len, self.slot_layout.align())?;
        let carving = self
            .slot_layout
            .carve(buffer.ptr(), buffer.len())
            .expect("blocks sized from the attributes always fit at least one slot");

        let mut state = self.lock();

        // Other threads may have reached the limit while we were unlocked. The new block
        // would then never see an allocation, so it goes straight back.
        if let Some(limit) = state.throttle_limit() {
            drop(state);
            buffer.release(&*self.backing);

            trace!(limit, "allocation throttled");
            return Err(Error::Throttled { limit });
        }

        // The object must come from the new block even if other threads freed slots elsewhere
        // in the meantime. Otherwise the new block may stay unused and is never released.
        let id = state.register(buffer, carving, &self.slot_layout);
        let object = state.reserve_from(id, &self.slot_layout);

        if cfg!(debug_assertions) {
            state.integrity_check();
        }

        Ok(object)
    }

    /// Returns an object to the pool.
    ///
    /// If this leaves its block without any allocated objects, the block may be given back to
    /// the backing allocator.
    ///
    /// # Panics
    ///
    /// Panics if the pointer does not lead to an object slot of this pool. Debug builds also
    /// panic if the slot is not allocated. This is not a complete safety net: passing such a
    /// pointer is undefined behavior in the first place.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `object` was returned by [`alloc()`](Self::alloc) on this
    /// pool and has not been deallocated since. The object memory must not be accessed
    /// afterwards.
    pub unsafe fn dealloc(&self, object: NonNull<u8>) {
        let mut state = self.lock();

        // SAFETY: Forwarding the guarantee from the caller that the object came from this pool.
        let header = unsafe { self.read_header(object) };

        let (id, index) = state.locate(object, header, &self.slot_layout);
        let released = state.release(id, index);

        if cfg!(debug_assertions) {
            state.integrity_check();
        }

        drop(state);

        if let Some(buffer) = released {
            buffer.release(&*self.backing);
        }
    }

    /// Registers caller-supplied memory as a new block.
    ///
    /// The buffer does not need to be aligned, a misaligned prefix is skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferTooSmall`] if not even one slot fits into the buffer. The release
    /// function of the buffer, if any, has already been called when this happens.
    ///
    /// # Safety
    ///
    /// The caller must uphold the contract of [`ExternalBuffer::new()`] and must ensure that
    /// the buffer does not overlap any other block of this pool.
    pub unsafe fn add_buffer(&self, buffer: ExternalBuffer) -> Result<()> {
        let buffer = buffer.into_detached();

        let Some(carving) = self.slot_layout.carve(buffer.ptr(), buffer.len()) else {
            let len = buffer.len();
            buffer.release(&*self.backing);

            return Err(Error::BufferTooSmall {
                len,
                stride: self.slot_layout.stride(),
            });
        };

        let mut state = self.lock();
        state.register(buffer, carving, &self.slot_layout);

        if cfg!(debug_assertions) {
            state.integrity_check();
        }

        Ok(())
    }

    /// Gives every block without allocated objects back to the backing allocator, regardless
    /// of [`PoolAttributes::min_cached_objects()`].
    ///
    /// Returns the number of released blocks.
    pub fn flush(&self) -> usize {
        let mut state = self.lock();
        let released = state.take_unused_blocks();

        if cfg!(debug_assertions) {
            state.integrity_check();
        }

        drop(state);

        let count = released.len();

        for buffer in released {
            buffer.release(&*self.backing);
        }

        debug!(blocks = count, "flushed unused blocks");

        count
    }

    /// Destroys the pool, provided that no objects are allocated.
    ///
    /// # Errors
    ///
    /// Returns [`PoolBusy`] if objects are still allocated. It hands the pool back unchanged.
    pub fn destroy(self) -> std::result::Result<(), PoolBusy> {
        let stats = self.stats();

        if stats.objects_allocated() > 0 {
            warn!(
                objects_allocated = stats.objects_allocated(),
                "refusing to destroy a pool that is still in use\n{stats}"
            );

            return Err(PoolBusy::new(self, stats));
        }

        self.destroy_forced();
        Ok(())
    }

    /// Destroys the pool, releasing all blocks even if objects are still allocated.
    ///
    /// Pointers to objects that were still allocated become dangling. This ignores the
    /// [drop policy][DropPolicy] of the pool.
    pub fn destroy_forced(mut self) {
        let outstanding = self.release_all_blocks();

        if outstanding > 0 {
            warn!(
                objects_allocated = outstanding,
                "forcibly destroyed a pool that was still in use"
            );
        }
    }

    /// Takes a snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.lock().stats(self.slot_layout.stride())
    }

    /// Writes the [stats][Self::stats] of the pool to `out` as text.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `out` fails.
    pub fn write_stats(&self, out: &mut impl fmt::Write) -> fmt::Result {
        write!(out, "{}", self.stats())
    }

    /// Calls `visit` with a snapshot of each block, until it returns [`ControlFlow::Break`].
    ///
    /// Returns the number of blocks visited, including the one that stopped the walk.
    ///
    /// The snapshots are taken all at once and `visit` runs without the pool lock held, so it
    /// may use the pool.
    pub fn walk_blocks(&self, mut visit: impl FnMut(&BlockStats) -> ControlFlow<()>) -> usize {
        let snapshots = self.lock().block_stats();
        let mut visited: usize = 0;

        for block in &snapshots {
            // Cannot wrap because there are not that many blocks.
            visited = visited.wrapping_add(1);

            if visit(block).is_break() {
                break;
            }
        }

        visited
    }

    /// Checks that `object` leads to an allocated object of this pool.
    ///
    /// Verifies the slot header, that the address lies in a block of the bucket named by the
    /// header, that it is at an object boundary and that the slot is marked as allocated.
    ///
    /// # Panics
    ///
    /// Panics if any of the checks fails.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `object` was returned by [`alloc()`](Self::alloc) on this
    /// pool and that the block it came from has not been released since. This holds at least
    /// as long as the object has not been deallocated.
    pub unsafe fn assert_allocated(&self, object: NonNull<u8>) {
        let state = self.lock();

        // SAFETY: Forwarding the guarantee from the caller that the block still exists.
        let header = unsafe { self.read_header(object) };

        let (id, index) = state.locate(object, header, &self.slot_layout);

        assert!(
            state.arena.get(id).is_slot_allocated(index),
            "object at {object:?} is not allocated - use after free?"
        );
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    pub(crate) fn integrity_check(&self) {
        self.lock().integrity_check();
    }

    /// # Safety
    ///
    /// `object` must point at an object of a block of this pool that has not been released.
    unsafe fn read_header(&self, object: NonNull<u8>) -> SlotHeader {
        // SAFETY: Every object is preceded by its slot header in the same buffer, and the
        // caller guarantees the buffer is still there.
        unsafe {
            object
                .sub(self.slot_layout.object_offset())
                .cast::<SlotHeader>()
                .read()
        }
    }

    /// Releases every block and returns how many objects were still allocated.
    fn release_all_blocks(&mut self) -> usize {
        // Each buffer is owned by exactly one block in the arena, so releasing them is sound
        // even if a panic left the directory or the free-list inconsistent.
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);

        let outstanding = state.total_allocated;
        let released = state.take_all_blocks();

        if !released.is_empty() {
            debug!(blocks = released.len(), "releasing all blocks");
        }

        for buffer in released {
            buffer.release(&*self.backing);
        }

        outstanding
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect(ERR_POISONED_LOCK)
    }
}

impl fmt::Debug for BlockPool {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPool")
            .field("slot_layout", &self.slot_layout)
            .field("bucket_count", &self.bucket_count)
            .field("drop_policy", &self.drop_policy)
            .finish_non_exhaustive()
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        let outstanding = self.release_all_blocks();

        if outstanding == 0 {
            return;
        }

        warn!(
            objects_allocated = outstanding,
            "dropped a pool that was still in use"
        );

        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if !thread::panicking() && matches!(self.drop_policy, DropPolicy::MustNotDropItems) {
            panic!(
                "dropped a BlockPool with {outstanding} allocated objects - \
                 this is forbidden by DropPolicy::MustNotDropItems"
            );
        }
    }
}

impl PoolState {
    /// The configured allocation limit, if it has been reached.
    fn throttle_limit(&self) -> Option<usize> {
        self.attributes
            .max_allocations()
            .filter(|limit| self.total_allocated >= *limit)
    }

    /// Adds a block built from `buffer` to the least loaded directory bucket and the free-list.
    fn register(
        &mut self,
        buffer: DetachedBuffer,
        carving: Carving,
        layout: &SlotLayout,
    ) -> BlockId {
        let bucket = self.directory.least_loaded();
        let block = Block::new(buffer, carving, layout, bucket);
        let capacity = block.capacity();
        let len = block.len();

        let id = self.arena.insert(block);
        self.directory.insert(&self.arena, id);
        self.free_list.insert(&mut self.arena, id);

        // Cannot wrap because every slot exists in memory.
        self.total_vacant = self.total_vacant.wrapping_add(capacity);

        debug!(bucket, capacity, len, "registered block");

        id
    }

    /// Takes a slot from the block closest to being full, if any block has a vacant slot.
    fn reserve(&mut self, layout: &SlotLayout) -> Option<NonNull<u8>> {
        let id = self.free_list.head()?;

        Some(self.reserve_from(id, layout))
    }

    /// Takes a slot from block `id`, which must have a vacant slot.
    fn reserve_from(&mut self, id: BlockId, layout: &SlotLayout) -> NonNull<u8> {
        let block = self.arena.get_mut(id);
        let object = block.reserve_slot(layout);
        let is_full = block.is_full();

        if is_full {
            self.free_list.remove(&mut self.arena, id);
        } else {
            self.free_list.reposition_after_reserve(&mut self.arena, id);
        }

        // Cannot wrap because the slot was vacant a moment ago.
        self.total_vacant = self.total_vacant.wrapping_sub(1);
        self.total_allocated = self.total_allocated.wrapping_add(1);

        object
    }

    /// Finds the block and slot index of an allocated object.
    ///
    /// # Panics
    ///
    /// Panics if the object cannot be traced back to a slot of this pool.
    fn locate(
        &self,
        object: NonNull<u8>,
        header: SlotHeader,
        layout: &SlotLayout,
    ) -> (BlockId, usize) {
        let bucket = header.bucket().unwrap_or_else(|| {
            panic!("object at {object:?} has a corrupt slot header - foreign pointer?")
        });

        let id = self
            .directory
            .resolve(&self.arena, bucket, object.addr().get())
            .unwrap_or_else(|| {
                panic!("object at {object:?} is not in any block of this pool - double free?")
            });

        let index = self
            .arena
            .get(id)
            .slot_index_of(object, layout)
            .unwrap_or_else(|| panic!("{object:?} does not point at the start of an object"));

        (id, index)
    }

    /// Returns slot `index` of block `id` to the vacant slots.
    ///
    /// If that leaves the block unused and enough vacant slots remain elsewhere, the block is
    /// unregistered and its buffer returned for releasing.
    fn release(&mut self, id: BlockId, index: usize) -> Option<DetachedBuffer> {
        let block = self.arena.get_mut(id);
        block.release_slot(index);

        let vacant = block.vacant();
        let capacity = block.capacity();

        // Cannot wrap because the slot was allocated a moment ago.
        self.total_vacant = self.total_vacant.wrapping_add(1);
        self.total_allocated = self.total_allocated.wrapping_sub(1);

        if vacant == 1 {
            self.free_list.insert_first_vacancy(&mut self.arena, id);
        } else {
            self.free_list.reposition_after_release(&mut self.arena, id);
        }

        if vacant == capacity && self.attributes.allows_release(self.total_vacant, capacity) {
            return Some(self.unregister(id));
        }

        None
    }

    /// Removes a block from all structures and returns its buffer for releasing.
    fn unregister(&mut self, id: BlockId) -> DetachedBuffer {
        if self.arena.get(id).free_list_links().is_listed() {
            self.free_list.remove(&mut self.arena, id);
        }

        self.directory.remove(&self.arena, id);
        let block = self.arena.remove(id);

        // Cannot wrap because the totals include this block.
        self.total_vacant = self.total_vacant.wrapping_sub(block.vacant());
        self.total_allocated = self.total_allocated.wrapping_sub(block.allocated());

        debug!(
            bucket = block.bucket(),
            capacity = block.capacity(),
            len = block.len(),
            "unregistered block"
        );

        block.into_detached()
    }

    /// Unregisters every block without allocated objects.
    fn take_unused_blocks(&mut self) -> Vec<DetachedBuffer> {
        // Unused blocks have the most vacant slots, so they gather at the tail. A smaller
        // unused block can still sit between larger partially used ones, so we look at all.
        let unused: Vec<BlockId> = self
            .free_list
            .iter_rev(&self.arena)
            .filter(|id| self.arena.get(*id).is_unused())
            .collect();

        unused.into_iter().map(|id| self.unregister(id)).collect()
    }

    /// Unregisters every block, allocated objects or not.
    fn take_all_blocks(&mut self) -> Vec<DetachedBuffer> {
        self.free_list = FreeList::new();
        self.directory = Directory::new(self.directory.bucket_count());
        self.total_vacant = 0;
        self.total_allocated = 0;

        self.arena.drain().map(Block::into_detached).collect()
    }

    fn stats(&self, object_size: usize) -> PoolStats {
        let mut stats = PoolStats::new(object_size, self.acquired);

        for id in self.directory.iter() {
            stats.add_block(&self.arena.get(id).stats());
        }

        stats
    }

    fn block_stats(&self) -> Vec<BlockStats> {
        self.directory
            .iter()
            .map(|id| self.arena.get(id).stats())
            .collect()
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    fn integrity_check(&self) {
        let mut vacant: usize = 0;
        let mut allocated: usize = 0;

        for id in self.directory.iter() {
            let block = self.arena.get(id);
            block.integrity_check();

            assert_eq!(
                block.free_list_links().is_listed(),
                !block.is_full(),
                "{id:?} free-list membership does not match its vacant slot count"
            );

            vacant = vacant.wrapping_add(block.vacant());
            allocated = allocated.wrapping_add(block.allocated());
        }

        assert_eq!(vacant, self.total_vacant, "pool vacant slot total is out of sync");
        assert_eq!(
            allocated, self.total_allocated,
            "pool allocated object total is out of sync"
        );

        assert_eq!(
            self.free_list.is_empty(),
            self.total_vacant == 0,
            "free-list must be empty exactly when no slot is vacant"
        );
        assert!(self.free_list.len() <= self.arena.len());

        self.directory.integrity_check(&self.arena);
        self.free_list.integrity_check(&self.arena);
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::alloc::{GlobalAlloc, System};
    use std::ptr;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(BlockPool: Send, Sync, fmt::Debug);

    /// Capacity of a 4096-byte block of 24-byte objects: 4096 / 28.
    const CAPACITY_24_IN_4096: usize = 146;

    #[derive(Debug, Default)]
    struct Counts {
        allocs: AtomicUsize,
        deallocs: AtomicUsize,
    }

    /// Delegates to the system allocator and counts the calls.
    struct CountingAllocator(Arc<Counts>);

    // SAFETY: Delegates every call to the system allocator unchanged.
    unsafe impl GlobalAlloc for CountingAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            self.0.allocs.fetch_add(1, Ordering::Relaxed);
            unsafe { System.alloc(layout) }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            self.0.deallocs.fetch_add(1, Ordering::Relaxed);
            unsafe { System.dealloc(ptr, layout) }
        }
    }

    struct FailingAllocator;

    // SAFETY: Never hands out memory, so there is nothing to get wrong.
    unsafe impl GlobalAlloc for FailingAllocator {
        unsafe fn alloc(&self, _layout: Layout) -> *mut u8 {
            ptr::null_mut()
        }

        unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
            unreachable!("nothing was ever allocated");
        }
    }

    /// Like [`CountingAllocator`] but slow to hand out memory, so that concurrent callers
    /// overlap while the pool lock is released.
    struct SlowAllocator(Arc<Counts>);

    // SAFETY: Delegates every call to the system allocator unchanged.
    unsafe impl GlobalAlloc for SlowAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            thread::sleep(Duration::from_millis(100));
            self.0.allocs.fetch_add(1, Ordering::Relaxed);
            unsafe { System.alloc(layout) }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            self.0.deallocs.fetch_add(1, Ordering::Relaxed);
            unsafe { System.dealloc(ptr, layout) }
        }
    }

    fn attributes(min_cached_objects: usize) -> PoolAttributes {
        PoolAttributes::new()
            .with_growth_granularity(4096)
            .with_min_cached_objects(min_cached_objects)
    }

    fn counting_pool(min_cached_objects: usize) -> (BlockPool, Arc<Counts>) {
        let counts = Arc::new(Counts::default());

        let pool = BlockPool::builder()
            .object_size(24)
            .attributes(attributes(min_cached_objects))
            .backing_allocator(CountingAllocator(Arc::clone(&counts)))
            .build();

        (pool, counts)
    }

    fn slow_pool(attributes: PoolAttributes) -> (BlockPool, Arc<Counts>) {
        let counts = Arc::new(Counts::default());

        let pool = BlockPool::builder()
            .object_size(24)
            .attributes(attributes)
            .backing_allocator(SlowAllocator(Arc::clone(&counts)))
            .build();

        (pool, counts)
    }

    fn block_containing(pool: &BlockPool, object: NonNull<u8>) -> Option<usize> {
        let mut found = None;
        let mut index = 0;

        pool.walk_blocks(|block| {
            let base = block.base().addr().get();

            if (base..base + block.len()).contains(&object.addr().get()) {
                found = Some(index);
                return ControlFlow::Break(());
            }

            index += 1;
            ControlFlow::Continue(())
        });

        found
    }

    #[test]
    fn first_alloc_creates_one_growth_unit() {
        let (pool, counts) = counting_pool(0);

        let object = pool.alloc().unwrap();

        let stats = pool.stats();
        assert_eq!(stats.block_count(), 1);
        assert_eq!(stats.bytes_held(), 4096);
        assert_eq!(stats.objects_allocated(), 1);
        assert_eq!(stats.objects_cached(), CAPACITY_24_IN_4096 - 1);
        assert_eq!(stats.objects_acquired(), 1);
        assert_eq!(counts.allocs.load(Ordering::Relaxed), 1);

        unsafe { pool.dealloc(object) };
        pool.integrity_check();
    }

    #[test]
    fn objects_are_aligned_and_distinct() {
        let pool = BlockPool::builder().layout_of::<u64>().build();

        let objects: Vec<_> = (0..100).map(|_| pool.alloc().unwrap()).collect();

        for (value, object) in objects.iter().enumerate() {
            assert_eq!(object.as_ptr().align_offset(align_of::<u64>()), 0);
            unsafe { object.cast::<u64>().write(value as u64) };
        }

        for (value, object) in objects.iter().enumerate() {
            assert_eq!(unsafe { object.cast::<u64>().read() }, value as u64);
            unsafe { pool.dealloc(*object) };
        }

        pool.integrity_check();
    }

    #[test]
    fn filling_a_block_then_draining_it_releases_it() {
        let (pool, counts) = counting_pool(0);

        let first_block: Vec<_> = (0..CAPACITY_24_IN_4096)
            .map(|_| pool.alloc().unwrap())
            .collect();

        assert_eq!(pool.stats().block_count(), 1);
        assert_eq!(pool.stats().objects_cached(), 0);

        // The first block is full, so this one needs a second block.
        let second = pool.alloc().unwrap();
        assert_eq!(pool.stats().block_count(), 2);
        assert_eq!(counts.allocs.load(Ordering::Relaxed), 2);

        let (last, rest) = first_block.split_last().unwrap();

        for object in rest {
            unsafe { pool.dealloc(*object) };
        }

        let before = pool.stats();
        assert_eq!(before.block_count(), 2);

        unsafe { pool.dealloc(*last) };

        let after = pool.stats();
        assert_eq!(after.block_count(), 1);
        assert_eq!(
            after.objects_cached(),
            before.objects_cached() + 1 - CAPACITY_24_IN_4096
        );
        assert_eq!(counts.deallocs.load(Ordering::Relaxed), 1);

        unsafe { pool.assert_allocated(second) };
        unsafe { pool.dealloc(second) };
        pool.integrity_check();
    }

    #[test]
    fn drained_block_is_kept_while_cache_is_needed() {
        let (pool, counts) = counting_pool(CAPACITY_24_IN_4096);

        let object = pool.alloc().unwrap();
        unsafe { pool.dealloc(object) };

        assert_eq!(pool.stats().block_count(), 1);
        assert_eq!(pool.stats().objects_cached(), CAPACITY_24_IN_4096);
        assert_eq!(counts.deallocs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn drained_block_is_released_without_cache() {
        let (pool, counts) = counting_pool(0);

        let object = pool.alloc().unwrap();
        unsafe { pool.dealloc(object) };

        assert_eq!(pool.stats().block_count(), 0);
        assert_eq!(counts.deallocs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn large_cache_sizes_blocks_for_it() {
        let (pool, _counts) = counting_pool(200);

        let object = pool.alloc().unwrap();

        // 200 objects of 28 bytes need two growth units.
        assert_eq!(pool.stats().bytes_held(), 8192);

        unsafe { pool.dealloc(object) };
    }

    #[test]
    fn throttled_after_max_allocations() {
        let pool = BlockPool::builder()
            .object_size(24)
            .attributes(attributes(0).with_max_allocations(Some(3)))
            .build();

        let objects: Vec<_> = (0..3).map(|_| pool.alloc().unwrap()).collect();

        assert!(matches!(pool.alloc(), Err(Error::Throttled { limit: 3 })));

        let stats = pool.stats();
        assert_eq!(stats.objects_allocated(), 3);
        assert_eq!(stats.objects_acquired(), 4);

        unsafe { pool.dealloc(objects[0]) };
        let replacement = pool.alloc().unwrap();

        unsafe { pool.dealloc(replacement) };
        unsafe { pool.dealloc(objects[1]) };
        unsafe { pool.dealloc(objects[2]) };
    }

    #[test]
    fn zero_max_allocations_throttles_everything() {
        let pool = BlockPool::builder()
            .object_size(24)
            .attributes(attributes(0).with_max_allocations(Some(0)))
            .build();

        assert!(matches!(pool.alloc(), Err(Error::Throttled { limit: 0 })));
        assert_eq!(pool.stats().block_count(), 0);
    }

    #[test]
    fn throttle_applies_to_later_changes() {
        let pool = BlockPool::builder().object_size(24).build();

        let first = pool.alloc().unwrap();
        pool.set_attributes(pool.attributes().with_max_allocations(Some(1)));

        assert!(matches!(pool.alloc(), Err(Error::Throttled { limit: 1 })));

        pool.set_attributes(pool.attributes().with_max_allocations(None));
        let second = pool.alloc().unwrap();

        unsafe { pool.dealloc(first) };
        unsafe { pool.dealloc(second) };
    }

    #[test]
    fn alloc_then_dealloc_restores_state() {
        let (pool, _counts) = counting_pool(0);

        let kept: Vec<_> = (0..200).map(|_| pool.alloc().unwrap()).collect();

        for object in kept.iter().step_by(3) {
            unsafe { pool.dealloc(*object) };
        }

        let snapshot = |pool: &BlockPool| {
            let mut blocks = Vec::new();
            pool.walk_blocks(|block| {
                blocks.push(*block);
                ControlFlow::Continue(())
            });
            blocks
        };

        let stats_before = pool.stats();
        let blocks_before = snapshot(&pool);

        let object = pool.alloc().unwrap();
        unsafe { pool.dealloc(object) };

        let stats_after = pool.stats();
        assert_eq!(stats_after.objects_cached(), stats_before.objects_cached());
        assert_eq!(stats_after.objects_allocated(), stats_before.objects_allocated());
        assert_eq!(stats_after.block_count(), stats_before.block_count());
        assert_eq!(stats_after.objects_acquired(), stats_before.objects_acquired() + 1);
        assert_eq!(snapshot(&pool), blocks_before);

        for object in kept.iter().enumerate().filter(|(i, _)| i % 3 != 0) {
            unsafe { pool.dealloc(*object.1) };
        }

        pool.integrity_check();
    }

    #[test]
    fn fullest_block_serves_next_allocation() {
        let (pool, _counts) = counting_pool(0);

        let objects: Vec<_> = (0..2 * CAPACITY_24_IN_4096)
            .map(|_| pool.alloc().unwrap())
            .collect();

        // Keep drained blocks from now on.
        pool.set_attributes(attributes(1000));

        let (first_block, second_block) = objects.split_at(CAPACITY_24_IN_4096);

        // Leave 10 vacant slots in the first block and 5 in the second.
        for object in &first_block[..10] {
            unsafe { pool.dealloc(*object) };
        }

        for object in &second_block[..5] {
            unsafe { pool.dealloc(*object) };
        }

        let target = block_containing(&pool, second_block[10]).unwrap();

        for _ in 0..5 {
            let object = pool.alloc().unwrap();
            assert_eq!(block_containing(&pool, object), Some(target));
        }

        // Now the second block is full again, so the first one takes over.
        let other = block_containing(&pool, first_block[20]).unwrap();
        let object = pool.alloc().unwrap();
        assert_eq!(block_containing(&pool, object), Some(other));

        pool.integrity_check();
        pool.destroy_forced();
    }

    #[test]
    fn out_of_memory_leaves_pool_unchanged() {
        let pool = BlockPool::builder()
            .object_size(24)
            .backing_allocator(FailingAllocator)
            .build();

        assert!(matches!(
            pool.alloc(),
            Err(Error::OutOfMemory { size: 8192 })
        ));

        let stats = pool.stats();
        assert_eq!(stats.block_count(), 0);
        assert_eq!(stats.bytes_held(), 0);
        assert_eq!(stats.objects_allocated(), 0);
        assert_eq!(stats.objects_cached(), 0);
        assert_eq!(stats.objects_acquired(), 1);
    }

    #[test]
    fn flush_releases_only_unused_blocks() {
        let (pool, counts) = counting_pool(0);

        let objects: Vec<_> = (0..3 * CAPACITY_24_IN_4096)
            .map(|_| pool.alloc().unwrap())
            .collect();

        // Keep drained blocks from now on, so only flush() releases them.
        pool.set_attributes(attributes(10_000));

        // Drain the first two blocks completely and the third one partially.
        for object in &objects[..2 * CAPACITY_24_IN_4096 + 10] {
            unsafe { pool.dealloc(*object) };
        }

        assert_eq!(pool.stats().block_count(), 3);

        assert_eq!(pool.flush(), 2);
        assert_eq!(pool.stats().block_count(), 1);
        assert_eq!(counts.deallocs.load(Ordering::Relaxed), 2);

        // Nothing left to flush.
        assert_eq!(pool.flush(), 0);

        for object in &objects[2 * CAPACITY_24_IN_4096 + 10..] {
            unsafe { pool.dealloc(*object) };
        }

        pool.integrity_check();
    }

    #[test]
    fn destroy_busy_pool_hands_it_back() {
        let (pool, counts) = counting_pool(0);

        let objects: Vec<_> = (0..3).map(|_| pool.alloc().unwrap()).collect();

        for (value, object) in objects.iter().enumerate() {
            unsafe { object.cast::<u32>().write(value as u32) };
        }

        let busy = pool.destroy().unwrap_err();
        assert_eq!(busy.stats().objects_allocated(), 3);

        let pool = busy.into_pool();

        for (value, object) in objects.iter().enumerate() {
            assert_eq!(unsafe { object.cast::<u32>().read() }, value as u32);
            unsafe { pool.assert_allocated(*object) };
        }

        pool.destroy_forced();

        assert_eq!(
            counts.allocs.load(Ordering::Relaxed),
            counts.deallocs.load(Ordering::Relaxed)
        );
    }

    #[test]
    fn destroy_idle_pool_succeeds() {
        let (pool, counts) = counting_pool(100);

        let object = pool.alloc().unwrap();
        unsafe { pool.dealloc(object) };

        pool.destroy().unwrap();

        assert_eq!(counts.deallocs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn destroy_forced_ignores_drop_policy() {
        let pool = BlockPool::builder()
            .object_size(24)
            .drop_policy(DropPolicy::MustNotDropItems)
            .build();

        _ = pool.alloc().unwrap();

        pool.destroy_forced();
    }

    #[test]
    fn drop_with_allocated_objects_releases_blocks() {
        let (pool, counts) = counting_pool(0);

        _ = pool.alloc().unwrap();
        drop(pool);

        assert_eq!(counts.deallocs.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[should_panic]
    fn drop_with_allocated_objects_panics_if_policy_must_not_drop() {
        let pool = BlockPool::builder()
            .object_size(24)
            .drop_policy(DropPolicy::MustNotDropItems)
            .build();

        _ = pool.alloc().unwrap();

        drop(pool);
    }

    #[test]
    fn drop_without_allocated_objects_does_not_panic_if_policy_must_not_drop() {
        let pool = BlockPool::builder()
            .object_size(24)
            .drop_policy(DropPolicy::MustNotDropItems)
            .build();

        let object = pool.alloc().unwrap();
        unsafe { pool.dealloc(object) };

        drop(pool);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn double_dealloc_panics() {
        let pool = BlockPool::new(24);

        let object = pool.alloc().unwrap();
        let _keep_block_alive = pool.alloc().unwrap();

        unsafe { pool.dealloc(object) };
        unsafe { pool.dealloc(object) };
    }

    #[test]
    #[should_panic]
    fn dealloc_from_other_pool_panics() {
        let pool1 = BlockPool::new(24);
        let pool2 = BlockPool::new(24);

        let object = pool1.alloc().unwrap();

        // Something must be in pool2, otherwise there is no block to check against.
        _ = pool2.alloc().unwrap();

        unsafe { pool2.dealloc(object) };
    }

    #[test]
    #[should_panic]
    fn assert_allocated_after_dealloc_panics() {
        let pool = BlockPool::new(24);

        let object = pool.alloc().unwrap();
        unsafe { pool.dealloc(object) };

        // The default attributes keep the drained block around.
        unsafe { pool.assert_allocated(object) };
    }

    #[test]
    #[should_panic]
    fn misaligned_pointer_panics() {
        let pool = BlockPool::new(24);

        let first = pool.alloc().unwrap();
        let _second = pool.alloc().unwrap();
        unsafe { first.cast::<[u8; 24]>().write([0; 24]) };

        // Points into the middle of the first object, so the "header" is object content.
        unsafe { pool.dealloc(first.add(8)) };
    }

    #[test]
    fn blocks_spread_over_buckets() {
        let pool = BlockPool::builder()
            .object_size(2000)
            .attributes(attributes(0))
            .bucket_count(2)
            .build();

        // Two 2004-byte slots fit into each 4096-byte block.
        let objects: Vec<_> = (0..8).map(|_| pool.alloc().unwrap()).collect();
        assert_eq!(pool.stats().block_count(), 4);

        for object in &objects {
            unsafe { pool.assert_allocated(*object) };
        }

        for object in objects.iter().rev() {
            unsafe { pool.dealloc(*object) };
        }

        assert_eq!(pool.stats().block_count(), 0);
    }

    #[test]
    fn walk_blocks_stops_on_break() {
        let (pool, _counts) = counting_pool(0);

        let objects: Vec<_> = (0..3 * CAPACITY_24_IN_4096)
            .map(|_| pool.alloc().unwrap())
            .collect();

        let mut seen = 0;
        let visited = pool.walk_blocks(|block| {
            seen += 1;
            assert_eq!(block.len(), 4096);
            assert_eq!(block.objects_allocated(), CAPACITY_24_IN_4096);
            ControlFlow::Break(())
        });

        assert_eq!(visited, 1);
        assert_eq!(seen, 1);

        let visited = pool.walk_blocks(|_| ControlFlow::Continue(()));
        assert_eq!(visited, 3);

        for object in objects {
            unsafe { pool.dealloc(object) };
        }
    }

    #[test]
    fn write_stats_matches_display() {
        let pool = BlockPool::new(24);
        let object = pool.alloc().unwrap();

        let mut text = String::new();
        pool.write_stats(&mut text).unwrap();

        assert_eq!(text, pool.stats().to_string());
        assert!(text.contains("objects_allocated: 1\n"));

        unsafe { pool.dealloc(object) };
    }

    #[test]
    fn fresh_pool_has_same_layout_and_default_attributes() {
        let pool = BlockPool::builder()
            .layout_of::<u128>()
            .attributes(attributes(0))
            .bucket_count(3)
            .build();

        let fresh = pool.fresh();

        assert_eq!(fresh.object_layout(), pool.object_layout());
        assert_eq!(fresh.bucket_count(), 3);
        assert_eq!(fresh.attributes(), PoolAttributes::default());
    }

    #[test]
    fn concurrent_alloc_and_dealloc_keep_invariants() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 50;
        const BATCH: usize = 40;

        let pool = Arc::new(
            BlockPool::builder()
                .object_size(24)
                .attributes(attributes(0))
                .build(),
        );

        let threads: Vec<_> = (0..THREADS)
            .map(|thread_index| {
                let pool = Arc::clone(&pool);

                thread::spawn(move || {
                    for round in 0..ROUNDS {
                        let objects: Vec<_> = (0..BATCH)
                            .map(|i| {
                                let object = pool.alloc().unwrap();
                                let tag = (thread_index * 1_000_000 + round * 1000 + i) as u32;
                                unsafe { object.cast::<u32>().write(tag) };
                                (object, tag)
                            })
                            .collect();

                        for (object, tag) in objects {
                            assert_eq!(unsafe { object.cast::<u32>().read() }, tag);
                            unsafe { pool.dealloc(object) };
                        }
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.objects_allocated(), 0);
        assert_eq!(stats.objects_acquired(), (THREADS * ROUNDS * BATCH) as u64);
        pool.integrity_check();
    }

    #[test]
    fn concurrent_growth_serves_each_caller_from_its_new_block() {
        let (pool, counts) = slow_pool(attributes(0));

        let start = Barrier::new(2);
        let allocated = Barrier::new(3);
        let inspected = Barrier::new(3);

        let (stats, idle_blocks) = thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    start.wait();
                    let object = pool.alloc().unwrap();

                    allocated.wait();
                    inspected.wait();

                    unsafe { pool.dealloc(object) };
                });
            }

            allocated.wait();

            let stats = pool.stats();
            let mut idle_blocks = 0;
            pool.walk_blocks(|block| {
                if block.objects_allocated() == 0 {
                    idle_blocks += 1;
                }

                ControlFlow::Continue(())
            });

            inspected.wait();

            (stats, idle_blocks)
        });

        assert_eq!(stats.objects_allocated(), 2);
        assert_eq!(idle_blocks, 0);

        // Every block drained, and no objects are cached, so nothing is left behind.
        assert_eq!(pool.stats().block_count(), 0);
        assert_eq!(
            counts.allocs.load(Ordering::Relaxed),
            counts.deallocs.load(Ordering::Relaxed)
        );
        pool.integrity_check();
    }

    #[test]
    fn concurrent_growth_past_the_limit_gives_back_the_new_block() {
        let (pool, counts) = slow_pool(attributes(0).with_max_allocations(Some(1)));

        let start = Barrier::new(2);
        let allocated = Barrier::new(3);
        let inspected = Barrier::new(3);

        let (stats, succeeded) = thread::scope(|s| {
            let workers: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        start.wait();
                        let result = pool.alloc();

                        allocated.wait();
                        inspected.wait();

                        match result {
                            Ok(object) => {
                                unsafe { pool.dealloc(object) };
                                true
                            }
                            Err(Error::Throttled { limit }) => {
                                assert_eq!(limit, 1);
                                false
                            }
                            Err(error) => panic!("unexpected error: {error}"),
                        }
                    })
                })
                .collect();

            allocated.wait();
            let stats = pool.stats();
            inspected.wait();

            let succeeded = workers
                .into_iter()
                .map(|worker| worker.join().unwrap())
                .filter(|ok| *ok)
                .count();

            (stats, succeeded)
        });

        assert_eq!(succeeded, 1);
        assert_eq!(stats.objects_allocated(), 1);
        assert_eq!(stats.block_count(), 1);

        assert_eq!(pool.stats().block_count(), 0);
        assert_eq!(
            counts.allocs.load(Ordering::Relaxed),
            counts.deallocs.load(Ordering::Relaxed)
        );
        pool.integrity_check();
    }
}
