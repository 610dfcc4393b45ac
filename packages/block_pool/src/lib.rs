//! A thread-safe pool allocator for objects of one fixed size.
//!
//! This crate provides [`BlockPool`], which hands out memory for individual objects carved from
//! larger blocks. Blocks come from a backing allocator (by default [`std::alloc::System`]) or
//! from caller-supplied buffers, and go back to it once they drain.
//!
//! # Key Features
//!
//! - **One object size per pool**: every allocation has the layout the pool was built with
//! - **Packs objects densely**: allocations are served from the fullest block that still has
//!   room, which lets other blocks drain completely and be released
//! - **Bounded deallocation cost**: each object records which directory bucket its block lives
//!   in, so finding the block only scans one bucket
//! - **Configurable at runtime**: growth granularity, cached slot count and an allocation cap
//!   via [`PoolAttributes`]
//! - **External buffers**: caller-supplied memory can be registered as a block via
//!   [`ExternalBuffer`]
//! - **Diagnostics**: [`PoolStats`] snapshots, per-block walks and on-demand pointer
//!   verification
//! - **Shared handles**: [`ManagedBlockPool`] for reference-counted use across threads
//!
//! # Example
//!
//! ```rust
//! use block_pool::{BlockPool, PoolAttributes};
//!
//! let pool = BlockPool::builder()
//!     .object_size(24)
//!     .attributes(
//!         PoolAttributes::new()
//!             .with_growth_granularity(4096)
//!             .with_min_cached_objects(0),
//!     )
//!     .build();
//!
//! let first = pool.alloc().unwrap();
//! let second = pool.alloc().unwrap();
//!
//! // A 24-byte object takes a 28-byte slot, so one 4096-byte block holds 146 of them.
//! let stats = pool.stats();
//! assert_eq!(stats.block_count(), 1);
//! assert_eq!(stats.objects_allocated(), 2);
//! assert_eq!(stats.objects_cached(), 144);
//!
//! // SAFETY: Both objects came from this pool and are deallocated once.
//! unsafe {
//!     pool.dealloc(first);
//!     pool.dealloc(second);
//! }
//!
//! // No objects are cached, so the drained block went back to the system allocator.
//! assert_eq!(pool.stats().block_count(), 0);
//! ```
//!
//! # Teardown
//!
//! [`BlockPool::destroy()`] only succeeds if no objects are allocated and otherwise hands the
//! pool back inside [`PoolBusy`]. [`BlockPool::destroy_forced()`] and dropping the pool release
//! all blocks regardless, subject to the pool's [`DropPolicy`].

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod arena;
mod attributes;
mod bitmap;
mod block;
mod buffer;
mod builder;
mod constants;
mod directory;
mod drop_policy;
mod error;
mod free_list;
mod managed;
mod pool;
mod slot_layout;
mod stats;

pub(crate) use arena::*;
pub use attributes::*;
pub(crate) use bitmap::*;
pub(crate) use block::*;
pub use buffer::{ExternalBuffer, ReleaseFn};
pub(crate) use buffer::{Backing, BufferOwner, DetachedBuffer, allocate};
pub use builder::*;
pub(crate) use directory::*;
pub use drop_policy::*;
pub use error::{Error, PoolBusy};
pub(crate) use error::Result;
pub(crate) use free_list::*;
pub use managed::*;
pub use pool::BlockPool;
pub(crate) use slot_layout::*;
pub use stats::*;
