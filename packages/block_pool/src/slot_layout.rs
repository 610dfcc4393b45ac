use std::alloc::Layout;
use std::ptr::NonNull;

/// Largest number of directory buckets a pool may use. The bucket index lives in the low
/// seven bits of the slot header, the eighth bit is reserved and always zero.
pub(crate) const MAX_BUCKET_COUNT: usize = 128;

/// The byte stored in front of every object, recording the directory bucket of the block
/// the object belongs to.
///
/// Written once when the block is created and never mutated afterwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub(crate) struct SlotHeader(u8);

impl SlotHeader {
    const RESERVED_BIT: u8 = 0x80;

    /// # Panics
    ///
    /// Panics if the bucket index does not fit into the header.
    #[must_use]
    pub(crate) fn for_bucket(bucket: usize) -> Self {
        let value = u8::try_from(bucket)
            .ok()
            .filter(|value| value & Self::RESERVED_BIT == 0)
            .unwrap_or_else(|| panic!("bucket index {bucket} does not fit into a slot header"));

        Self(value)
    }

    /// The bucket index recorded in the header, or `None` if the header is corrupt.
    #[must_use]
    pub(crate) fn bucket(self) -> Option<usize> {
        if self.0 & Self::RESERVED_BIT != 0 {
            return None;
        }

        Some(usize::from(self.0))
    }
}

/// Layout calculations for the slots of a pool.
///
/// Every slot is a [`SlotHeader`] followed by the object, padded so that consecutive slots
/// keep both the header and the object properly aligned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct SlotLayout {
    /// Layout of the caller-visible object.
    object_layout: Layout,

    /// Combined header + object layout, padded to its alignment. The size is the distance
    /// between the starts of two neighboring slots.
    slot_layout: Layout,

    /// Byte offset from the start of a slot to the start of its object.
    object_offset: usize,
}

/// Where the slots of a block start inside its buffer and how many of them fit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Carving {
    pub(crate) first_slot: NonNull<u8>,
    pub(crate) capacity: usize,
}

impl SlotLayout {
    /// # Panics
    ///
    /// Panics if the object layout has zero size or if layout calculations overflow.
    #[must_use]
    pub(crate) fn calculate(object_layout: Layout) -> Self {
        assert!(
            object_layout.size() > 0,
            "SlotLayout cannot be calculated for a zero-sized object layout"
        );

        let (slot_layout, object_offset) = Layout::new::<SlotHeader>()
            .extend(object_layout)
            .expect("layout extension cannot fail for valid layouts with reasonable sizes");

        Self {
            object_layout,
            slot_layout: slot_layout.pad_to_align(),
            object_offset,
        }
    }

    #[must_use]
    pub(crate) fn object_layout(&self) -> Layout {
        self.object_layout
    }

    /// Distance in bytes between two neighboring slots.
    #[must_use]
    pub(crate) fn stride(&self) -> usize {
        self.slot_layout.size()
    }

    /// Alignment every block buffer must satisfy for its first slot.
    #[must_use]
    pub(crate) fn align(&self) -> usize {
        self.slot_layout.align()
    }

    #[must_use]
    pub(crate) fn object_offset(&self) -> usize {
        self.object_offset
    }

    /// Determines how a buffer of `len` bytes starting at `buffer` is divided into slots.
    ///
    /// The first slot starts at the first suitably aligned address. Returns `None` if not even
    /// one slot fits.
    #[must_use]
    pub(crate) fn carve(&self, buffer: NonNull<u8>, len: usize) -> Option<Carving> {
        let padding = buffer.align_offset(self.align());
        let usable = len.checked_sub(padding)?;

        let capacity = usable.checked_div(self.stride())?;

        if capacity == 0 {
            return None;
        }

        // SAFETY: `padding < len` was verified above, so the result stays inside the buffer.
        let first_slot = unsafe { buffer.add(padding) };

        Some(Carving {
            first_slot,
            capacity,
        })
    }
}

#[cfg(test)]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_bucket_index() {
        for bucket in [0, 1, 24, 127] {
            assert_eq!(SlotHeader::for_bucket(bucket).bucket(), Some(bucket));
        }
    }

    #[test]
    #[should_panic]
    fn header_rejects_reserved_bit() {
        _ = SlotHeader::for_bucket(MAX_BUCKET_COUNT);
    }

    #[test]
    fn header_with_reserved_bit_is_corrupt() {
        assert_eq!(SlotHeader(0x85).bucket(), None);
    }

    #[test]
    fn four_byte_aligned_object_gets_four_byte_header() {
        let layout = SlotLayout::calculate(Layout::from_size_align(24, 4).unwrap());

        assert_eq!(layout.object_offset(), 4);
        assert_eq!(layout.stride(), 28);
        assert_eq!(layout.align(), 4);
    }

    #[test]
    fn byte_aligned_object_packs_tightly() {
        let layout = SlotLayout::calculate(Layout::from_size_align(7, 1).unwrap());

        assert_eq!(layout.object_offset(), 1);
        assert_eq!(layout.stride(), 8);
        assert_eq!(layout.align(), 1);
    }

    #[test]
    fn stride_keeps_large_alignment() {
        let layout = SlotLayout::calculate(Layout::new::<u128>());

        assert_eq!(layout.object_offset(), align_of::<u128>());
        assert_eq!(layout.stride() % align_of::<u128>(), 0);
        assert!(layout.stride() >= size_of::<u128>() + 1);
    }

    #[test]
    #[should_panic]
    fn zero_sized_object_panics() {
        _ = SlotLayout::calculate(Layout::new::<()>());
    }

    #[test]
    fn carve_skips_misaligned_prefix() {
        let layout = SlotLayout::calculate(Layout::from_size_align(12, 4).unwrap());
        let mut storage = [0_u32; 64];
        let base = NonNull::from(&mut storage).cast::<u8>();

        // Start one byte in, so three bytes of padding are needed.
        let buffer = unsafe { base.add(1) };
        let carving = layout.carve(buffer, 255).unwrap();

        assert_eq!(carving.first_slot, unsafe { base.add(4) });
        assert_eq!(carving.capacity, 252 / 16);
    }

    #[test]
    fn carve_too_small_buffer_is_none() {
        let layout = SlotLayout::calculate(Layout::from_size_align(12, 4).unwrap());
        let mut storage = [0_u32; 4];
        let base = NonNull::from(&mut storage).cast::<u8>();

        assert_eq!(layout.carve(base, 15), None);
        assert!(layout.carve(base, 16).is_some());
    }
}
