use thiserror::Error;

use crate::{BlockPool, PoolStats};

/// Errors that can occur when obtaining memory from a [`BlockPool`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A new block was needed but the backing allocator could not supply its memory.
    #[error("out of memory: could not obtain a block buffer of {size} bytes")]
    OutOfMemory {
        /// Length of the buffer that was requested.
        size: usize,
    },

    /// The pool already has as many objects allocated as its attributes allow.
    ///
    /// This is an expected outcome of a configured allocation cap, not a fault.
    #[error("allocation limit of {limit} objects reached")]
    Throttled {
        /// The configured maximum number of concurrently allocated objects.
        limit: usize,
    },

    /// A caller-supplied buffer cannot hold even one slot once aligned.
    #[error("buffer of {len} bytes is too small for a slot of {stride} bytes")]
    BufferTooSmall {
        /// Length of the rejected buffer.
        len: usize,

        /// Bytes each slot of the pool occupies.
        stride: usize,
    },
}

/// A specialized `Result` type for block pool operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Returned by [`BlockPool::destroy()`] when objects are still allocated.
///
/// The pool is handed back untouched, so the caller may deallocate the outstanding objects and
/// try again, or tear the pool down anyway via [`BlockPool::destroy_forced()`].
#[derive(Debug, Error)]
#[error("pool is busy: {} objects are still allocated", .stats.objects_allocated())]
pub struct PoolBusy {
    pool: BlockPool,
    stats: PoolStats,
}

impl PoolBusy {
    pub(crate) fn new(pool: BlockPool, stats: PoolStats) -> Self {
        Self { pool, stats }
    }

    /// The state of the pool at the time the destroy attempt was refused.
    #[must_use]
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Takes back the pool, which remains fully usable.
    #[must_use]
    pub fn into_pool(self) -> BlockPool {
        self.pool
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);
    assert_impl_all!(PoolBusy: Send, Sync, Debug);

    #[test]
    fn messages_carry_details() {
        let error = Error::Throttled { limit: 7 };
        assert!(error.to_string().contains('7'));

        let error = Error::BufferTooSmall { len: 3, stride: 28 };
        let message = error.to_string();
        assert!(message.contains('3'));
        assert!(message.contains("28"));

        let error = Error::OutOfMemory { size: 8192 };
        assert!(error.to_string().contains("8192"));
    }
}
