//! Integration tests for the `block_pool` package.
//!
//! These exercise the public API the way a consumer would: sizing and growth of blocks,
//! release of drained blocks, caller-supplied buffers, teardown and use from multiple threads.

use std::alloc::{Layout, alloc, dealloc};
use std::ops::ControlFlow;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use block_pool::{BlockPool, Error, ExternalBuffer, ManagedBlockPool, PoolAttributes};

const BUFFER_ALIGN: usize = 8;

fn small_block_attributes() -> PoolAttributes {
    PoolAttributes::new()
        .with_growth_granularity(4096)
        .with_min_cached_objects(0)
}

/// Allocates a buffer from the global allocator and wraps it with a release function that
/// counts how often it is called before freeing the memory.
fn counted_buffer(len: usize, releases: &Arc<AtomicUsize>) -> ExternalBuffer {
    let layout = Layout::from_size_align(len, BUFFER_ALIGN).unwrap();
    // SAFETY: Callers never ask for zero-length buffers.
    let ptr = NonNull::new(unsafe { alloc(layout) }).unwrap();

    let releases = Arc::clone(releases);

    // SAFETY: Freshly allocated and not shared with anything else.
    unsafe { ExternalBuffer::new(ptr, len) }.with_release(move |ptr, released_len| {
        assert_eq!(released_len, layout.size());
        releases.fetch_add(1, Ordering::Relaxed);
        // SAFETY: Allocated above with this exact layout.
        unsafe { dealloc(ptr.as_ptr(), layout) };
    })
}

#[test]
fn block_lifecycle_with_24_byte_objects() {
    let pool = BlockPool::builder()
        .object_size(24)
        .attributes(small_block_attributes())
        .build();

    let first = pool.alloc().unwrap();

    let stats = pool.stats();
    assert_eq!(stats.block_count(), 1);
    assert_eq!(stats.bytes_held(), 4096);
    assert_eq!(stats.object_size(), 28);

    let capacity = stats.objects_cached() + 1;
    assert_eq!(capacity, 4096 / 28);

    let mut first_block = vec![first];
    first_block.extend((1..capacity).map(|_| pool.alloc().unwrap()));
    assert_eq!(pool.stats().block_count(), 1);
    assert_eq!(pool.stats().objects_cached(), 0);

    let second_block = pool.alloc().unwrap();
    assert_eq!(pool.stats().block_count(), 2);

    let cached_before = pool.stats().objects_cached();

    for object in &first_block {
        // SAFETY: Allocated from this pool above and deallocated once.
        unsafe { pool.dealloc(*object) };
    }

    let stats = pool.stats();
    assert_eq!(stats.block_count(), 1);
    assert_eq!(stats.objects_cached(), cached_before);
    assert_eq!(stats.objects_allocated(), 1);

    // SAFETY: Allocated from this pool above and deallocated once.
    unsafe { pool.dealloc(second_block) };

    assert_eq!(pool.stats().block_count(), 0);
    pool.destroy().unwrap();
}

#[test]
fn every_live_object_is_verifiable() {
    let pool = BlockPool::builder()
        .object_size(100)
        .attributes(small_block_attributes())
        .bucket_count(4)
        .build();

    let objects: Vec<_> = (0..500).map(|_| pool.alloc().unwrap()).collect();

    for object in &objects {
        // SAFETY: Every object is still allocated.
        unsafe { pool.assert_allocated(*object) };
    }

    let mut seen = 0;
    let visited = pool.walk_blocks(|block| {
        seen += block.objects_allocated();
        ControlFlow::Continue(())
    });

    assert_eq!(seen, 500);
    assert_eq!(visited, pool.stats().block_count());

    for object in objects {
        // SAFETY: Allocated from this pool above and deallocated once.
        unsafe { pool.dealloc(object) };
    }
}

#[test]
fn max_allocations_caps_live_objects() {
    let pool = BlockPool::builder()
        .object_size(24)
        .attributes(small_block_attributes().with_max_allocations(Some(5)))
        .build();

    let objects: Vec<_> = (0..5).map(|_| pool.alloc().unwrap()).collect();

    assert!(matches!(pool.alloc(), Err(Error::Throttled { limit: 5 })));
    assert!(matches!(pool.alloc(), Err(Error::Throttled { limit: 5 })));
    assert_eq!(pool.stats().objects_acquired(), 7);

    for object in objects {
        // SAFETY: Allocated from this pool above and deallocated once.
        unsafe { pool.dealloc(object) };
    }

    assert!(pool.alloc().is_ok());
}

#[test]
fn forced_destroy_with_outstanding_objects() {
    let pool = BlockPool::new(24);

    let objects: Vec<_> = (0..3).map(|_| pool.alloc().unwrap()).collect();

    for (value, object) in (10_u32..).zip(&objects) {
        // SAFETY: The objects are 24 bytes aligned to 4, enough for a u32.
        unsafe { object.cast::<u32>().write(value) };
    }

    let busy = pool.destroy().unwrap_err();
    assert_eq!(busy.stats().objects_allocated(), 3);
    assert!(busy.to_string().contains('3'));

    let pool = busy.into_pool();

    for (value, object) in (10_u32..).zip(&objects) {
        // SAFETY: The pool was not destroyed, so the objects are still valid.
        assert_eq!(unsafe { object.cast::<u32>().read() }, value);
    }

    pool.destroy_forced();
}

#[test]
fn external_buffer_is_released_when_drained() {
    let releases = Arc::new(AtomicUsize::new(0));

    let pool = BlockPool::builder()
        .object_size(24)
        .attributes(small_block_attributes())
        .build();

    // SAFETY: The buffer is exclusively owned and released only through its release function.
    unsafe { pool.add_buffer(counted_buffer(1024, &releases)) }.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.block_count(), 1);
    assert_eq!(stats.bytes_held(), 1024);
    assert_eq!(stats.objects_cached(), 1024 / 28);

    // Served from the external block, no new block needed.
    let object = pool.alloc().unwrap();
    assert_eq!(pool.stats().block_count(), 1);

    // SAFETY: Allocated from this pool above and deallocated once.
    unsafe { pool.dealloc(object) };

    assert_eq!(pool.stats().block_count(), 0);
    assert_eq!(releases.load(Ordering::Relaxed), 1);
}

#[test]
fn external_buffer_is_released_on_destroy() {
    let releases = Arc::new(AtomicUsize::new(0));
    let pool = BlockPool::new(24);

    // SAFETY: The buffer is exclusively owned and released only through its release function.
    unsafe { pool.add_buffer(counted_buffer(2048, &releases)) }.unwrap();
    assert_eq!(releases.load(Ordering::Relaxed), 0);

    pool.destroy().unwrap();
    assert_eq!(releases.load(Ordering::Relaxed), 1);
}

#[test]
fn external_buffer_without_release_is_left_alone() {
    let mut storage = vec![0_u64; 128];
    let ptr = NonNull::from(storage.as_mut_slice()).cast::<u8>();

    let pool = BlockPool::builder()
        .object_size(24)
        .attributes(small_block_attributes())
        .build();

    // SAFETY: The storage outlives the pool and is not touched while the pool uses it.
    unsafe { pool.add_buffer(ExternalBuffer::new(ptr, 1024)) }.unwrap();

    let object = pool.alloc().unwrap();
    // SAFETY: Allocated from this pool above and deallocated once.
    unsafe { pool.dealloc(object) };

    // The drained block was unregistered but its memory is still ours.
    assert_eq!(pool.stats().block_count(), 0);

    // SAFETY: The storage outlives the pool and is not touched while the pool uses it.
    unsafe { pool.add_buffer(ExternalBuffer::new(ptr, 1024)) }.unwrap();
    assert_eq!(pool.flush(), 1);
    drop(pool);

    storage.fill(7);
    assert!(storage.iter().all(|word| *word == 7));
}

#[test]
fn too_small_external_buffer_is_rejected_and_released() {
    let releases = Arc::new(AtomicUsize::new(0));
    let pool = BlockPool::new(24);

    // SAFETY: The buffer is exclusively owned and released only through its release function.
    let result = unsafe { pool.add_buffer(counted_buffer(16, &releases)) };

    assert!(matches!(
        result,
        Err(Error::BufferTooSmall { len: 16, stride: 28 })
    ));
    assert_eq!(releases.load(Ordering::Relaxed), 1);
    assert_eq!(pool.stats().block_count(), 0);
}

#[test]
fn misaligned_external_buffer_skips_prefix() {
    let releases = Arc::new(AtomicUsize::new(0));
    let layout = Layout::from_size_align(1024, BUFFER_ALIGN).unwrap();
    // SAFETY: The layout has a non-zero size.
    let base = NonNull::new(unsafe { alloc(layout) }).unwrap();

    // Hand over all but the first byte, so the slots cannot start at the beginning.
    // SAFETY: The buffer is 1024 bytes long.
    let shifted = unsafe { base.add(1) };

    let releases_clone = Arc::clone(&releases);

    // SAFETY: The remainder of the buffer is exclusively owned and outlives its registration.
    let buffer = unsafe { ExternalBuffer::new(shifted, 1023) }.with_release(move |ptr, len| {
        assert_eq!(len, 1023);
        releases_clone.fetch_add(1, Ordering::Relaxed);
        // SAFETY: The released pointer is one byte into the buffer allocated above.
        unsafe { dealloc(ptr.sub(1).as_ptr(), layout) };
    });

    let pool = BlockPool::builder()
        .layout_of::<u64>()
        .attributes(small_block_attributes())
        .build();

    // SAFETY: See the buffer construction above.
    unsafe { pool.add_buffer(buffer) }.unwrap();

    // Seven bytes of padding are skipped, 16-byte slots fill the rest.
    assert_eq!(pool.stats().objects_cached(), 1016 / 16);

    let object = pool.alloc().unwrap();
    assert_eq!(object.as_ptr().align_offset(align_of::<u64>()), 0);

    // SAFETY: Allocated from this pool above and deallocated once.
    unsafe { pool.dealloc(object) };

    assert_eq!(releases.load(Ordering::Relaxed), 1);
}

#[test]
fn flush_returns_cached_blocks() {
    let pool = BlockPool::builder().object_size(24).build();

    let objects: Vec<_> = (0..1000).map(|_| pool.alloc().unwrap()).collect();
    let blocks = pool.stats().block_count();
    assert!(blocks > 1);

    for object in objects {
        // SAFETY: Allocated from this pool above and deallocated once.
        unsafe { pool.dealloc(object) };
    }

    // The default attributes keep some vacant slots cached.
    assert!(pool.stats().block_count() >= 1);

    let flushed = pool.flush();
    assert!(flushed >= 1);
    assert_eq!(pool.stats().block_count(), 0);
    assert_eq!(pool.stats().bytes_held(), 0);
}

#[test]
fn stats_text_lists_counters() {
    let pool = BlockPool::builder()
        .object_size(24)
        .attributes(small_block_attributes())
        .build();

    let object = pool.alloc().unwrap();

    let mut text = String::new();
    pool.write_stats(&mut text).unwrap();

    assert_eq!(
        text,
        "bytes_held: 4096 bytes\n\
         object_size: 28 bytes\n\
         objects_cached: 145\n\
         objects_allocated: 1\n\
         objects_acquired: 1\n\
         block_count: 1\n"
    );

    // SAFETY: Allocated from this pool above and deallocated once.
    unsafe { pool.dealloc(object) };
}

#[test]
fn shared_pool_from_many_threads() {
    const THREADS: usize = 8;
    const OBJECTS_PER_THREAD: usize = 300;

    let pool = ManagedBlockPool::from(
        BlockPool::builder()
            .object_size(24)
            .attributes(small_block_attributes())
            .build(),
    );

    let barrier = Arc::new(Barrier::new(THREADS));

    let threads: Vec<_> = (0..THREADS)
        .map(|thread_index| {
            let pool = pool.clone();
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();

                let tag = u32::try_from(thread_index).unwrap();
                let objects: Vec<_> = (0..OBJECTS_PER_THREAD)
                    .map(|_| {
                        let object = pool.alloc().unwrap();
                        // SAFETY: 24 bytes aligned to 4 fit a u32.
                        unsafe { object.cast::<u32>().write(tag) };
                        object
                    })
                    .collect();

                // Deallocate every second object, then the rest.
                for object in objects.iter().step_by(2).chain(objects.iter().skip(1).step_by(2)) {
                    // SAFETY: Written above and not shared with other threads.
                    assert_eq!(unsafe { object.cast::<u32>().read() }, tag);
                    // SAFETY: Allocated from this pool above and deallocated once.
                    unsafe { pool.dealloc(*object) };
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.objects_allocated(), 0);
    assert_eq!(stats.block_count(), 0);
    assert_eq!(
        stats.objects_acquired(),
        u64::try_from(THREADS * OBJECTS_PER_THREAD).unwrap()
    );
    assert_eq!(pool.ref_count(), 1);
}
