/// Determines what happens to outstanding objects when a [`BlockPool`][crate::BlockPool] is
/// dropped.
///
/// By default, the pool releases all of its blocks regardless, leaving any outstanding object
/// pointers dangling.
///
/// # Examples
///
/// ```
/// use block_pool::{BlockPool, DropPolicy};
///
/// // The drop policy is set at pool creation time.
/// let pool = BlockPool::builder()
///     .object_size(24)
///     .drop_policy(DropPolicy::MustNotDropItems)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The pool releases its blocks even if objects are still allocated. A warning is logged.
    /// This is the default.
    #[default]
    MayDropItems,

    /// The pool will panic if objects are still allocated when it is dropped.
    ///
    /// This may be valuable if outstanding objects indicate a bug, for example because every
    /// object is expected to be deallocated by its owner before the pool goes away.
    MustNotDropItems,
}
