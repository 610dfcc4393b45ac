use std::alloc::{GlobalAlloc, Layout};
use std::fmt;
use std::ptr::NonNull;

use tracing::warn;

use crate::{Error, Result};

/// Releases a caller-supplied buffer once the pool no longer uses it.
///
/// Receives the same pointer and length the buffer was registered with.
pub type ReleaseFn = Box<dyn FnOnce(NonNull<u8>, usize) + Send>;

/// The allocator that supplies and reclaims the memory of pool-owned blocks.
pub(crate) type Backing = dyn GlobalAlloc + Send + Sync;

/// A caller-supplied region of memory that a pool may carve into slots.
///
/// By default the pool never frees the memory. Attach a release function via
/// [`with_release()`](Self::with_release) to have the pool hand the buffer back once the block
/// built from it is released (drained, flushed or destroyed) or once registration fails.
///
/// # Example
///
/// ```rust
/// use std::alloc::{Layout, alloc, dealloc};
/// use std::ptr::NonNull;
///
/// use block_pool::{BlockPool, ExternalBuffer};
///
/// let pool = BlockPool::new(16);
///
/// let layout = Layout::from_size_align(4096, 8).unwrap();
/// // SAFETY: The layout has a non-zero size.
/// let ptr = NonNull::new(unsafe { alloc(layout) }).unwrap();
///
/// // SAFETY: The memory is valid for 4096 bytes and nobody else touches it until released.
/// let buffer = unsafe { ExternalBuffer::new(ptr, layout.size()) }
///     // SAFETY: The pointer came from `alloc()` with this exact layout.
///     .with_release(move |ptr, _len| unsafe { dealloc(ptr.as_ptr(), layout) });
///
/// // SAFETY: See the buffer construction above.
/// unsafe { pool.add_buffer(buffer) }.unwrap();
///
/// assert_eq!(pool.stats().block_count(), 1);
/// ```
pub struct ExternalBuffer {
    ptr: NonNull<u8>,
    len: usize,
    release: Option<ReleaseFn>,
}

impl ExternalBuffer {
    /// Describes `len` bytes of memory starting at `ptr`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the memory is valid for reads and writes of `len` bytes and
    /// that nothing else accesses it (other than through pointers handed out by the pool) until
    /// the release function is called or, if there is none, until the pool is destroyed.
    #[must_use]
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len,
            release: None,
        }
    }

    /// Sets the function the pool calls to give the memory back.
    #[must_use]
    pub fn with_release(
        mut self,
        release: impl FnOnce(NonNull<u8>, usize) + Send + 'static,
    ) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    /// Start of the buffer.
    #[must_use]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length of the buffer in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer has zero length.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn into_detached(self) -> DetachedBuffer {
        DetachedBuffer {
            ptr: self.ptr,
            len: self.len,
            owner: BufferOwner::External(self.release),
        }
    }
}

impl fmt::Debug for ExternalBuffer {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

// SAFETY: The contract of `ExternalBuffer::new()` hands exclusive use of the memory to whoever
// holds the buffer, so moving it to another thread does not create shared access. The release
// function is itself required to be `Send`.
unsafe impl Send for ExternalBuffer {}

/// Who gave us the memory of a block and therefore how to give it back.
pub(crate) enum BufferOwner {
    /// Allocated from the pool's backing allocator with this layout.
    Backing(Layout),

    /// Supplied by the caller. Released through the function, if there is one.
    External(Option<ReleaseFn>),
}

impl fmt::Debug for BufferOwner {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backing(layout) => f.debug_tuple("Backing").field(layout).finish(),
            Self::External(release) => f
                .debug_tuple("External")
                .field(&release.as_ref().map(|_| "release fn"))
                .finish(),
        }
    }
}

/// Memory that is not part of any registered block: either freshly obtained and waiting to be
/// registered, or taken out of all pool data structures and waiting to be given back.
///
/// Kept separate from the block metadata so that both obtaining and releasing the memory can
/// happen while the pool lock is not held.
#[derive(Debug)]
#[must_use = "the memory leaks unless release() is called"]
pub(crate) struct DetachedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    owner: BufferOwner,
}

impl DetachedBuffer {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize, owner: BufferOwner) -> Self {
        Self { ptr, len, owner }
    }

    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn into_parts(self) -> (NonNull<u8>, usize, BufferOwner) {
        (self.ptr, self.len, self.owner)
    }

    /// Hands the memory back to whoever supplied it.
    pub(crate) fn release(self, backing: &Backing) {
        match self.owner {
            BufferOwner::Backing(layout) => {
                // SAFETY: Buffers with this owner were allocated by `allocate()` from the same
                // backing allocator with exactly this layout, and each one is released once.
                unsafe {
                    backing.dealloc(self.ptr.as_ptr(), layout);
                }
            }
            BufferOwner::External(Some(release)) => release(self.ptr, self.len),
            BufferOwner::External(None) => {}
        }
    }
}

// SAFETY: A detached buffer is no longer reachable through the pool, so whoever holds it has
// exclusive use of the memory. The release function is `Send`.
unsafe impl Send for DetachedBuffer {}

/// Obtains `len` bytes with the given alignment from the backing allocator.
///
/// Debug builds hand out zeroed memory so stale contents are easier to spot.
pub(crate) fn allocate(backing: &Backing, len: usize, align: usize) -> Result<DetachedBuffer> {
    let out_of_memory = || Error::OutOfMemory { size: len };

    let layout = Layout::from_size_align(len, align).map_err(|_invalid_layout| out_of_memory())?;

    if layout.size() == 0 {
        return Err(out_of_memory());
    }

    // SAFETY: The layout has a non-zero size, verified above.
    #[cfg(debug_assertions)]
    let ptr = unsafe { backing.alloc_zeroed(layout) };

    // SAFETY: The layout has a non-zero size, verified above.
    #[cfg(not(debug_assertions))]
    let ptr = unsafe { backing.alloc(layout) };

    let Some(ptr) = NonNull::new(ptr) else {
        warn!(size = len, "backing allocator is out of memory");
        return Err(out_of_memory());
    };

    Ok(DetachedBuffer::new(ptr, len, BufferOwner::Backing(layout)))
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::alloc::System;
    use std::ptr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ExternalBuffer: Send, fmt::Debug);
    assert_impl_all!(DetachedBuffer: Send);

    struct NullAllocator;

    // SAFETY: Never hands out memory, so there is nothing to get wrong.
    unsafe impl GlobalAlloc for NullAllocator {
        unsafe fn alloc(&self, _layout: Layout) -> *mut u8 {
            ptr::null_mut()
        }

        unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
            unreachable!("nothing was ever allocated");
        }
    }

    #[test]
    fn allocate_and_release_through_backing() {
        let buffer = allocate(&System, 4096, 8).unwrap();

        assert_eq!(buffer.len(), 4096);
        assert_eq!(buffer.ptr().as_ptr().align_offset(8), 0);

        buffer.release(&System);
    }

    #[test]
    fn allocation_failure_is_out_of_memory() {
        let result = allocate(&NullAllocator, 4096, 8);

        assert!(matches!(result, Err(Error::OutOfMemory { size: 4096 })));
    }

    #[test]
    fn invalid_alignment_is_out_of_memory() {
        let result = allocate(&System, 4096, 3);

        assert!(matches!(result, Err(Error::OutOfMemory { .. })));
    }

    #[test]
    fn external_release_receives_original_parts() {
        let mut storage = [0_u8; 32];
        let ptr = NonNull::from(&mut storage).cast::<u8>();

        let expected_addr = ptr.addr();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let buffer = unsafe { ExternalBuffer::new(ptr, 32) }.with_release(move |released, len| {
            assert_eq!(released.addr(), expected_addr);
            assert_eq!(len, 32);
            calls_clone.fetch_add(1, Ordering::Relaxed);
        });

        buffer.into_detached().release(&NullAllocator);

        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn external_without_release_is_left_alone() {
        let mut storage = [0_u8; 32];
        let ptr = NonNull::from(&mut storage).cast::<u8>();

        let buffer = unsafe { ExternalBuffer::new(ptr, 32) };
        assert!(!buffer.is_empty());

        // NullAllocator panics if asked to free anything.
        buffer.into_detached().release(&NullAllocator);
    }
}
