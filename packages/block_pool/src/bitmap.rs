//! Occupancy bitmap for the slots of a single block.
//!
//! Only the operations the allocation and deallocation paths need are provided: flipping a
//! bit, reading a bit and locating a clear bit, either near a cached hint or anywhere.

use num_integer::Integer;

/// The type used for storage words in the bitmap.
type Word = u64;

/// Number of bits in each storage word.
const BITS_PER_WORD: usize = Word::BITS as usize;

/// A fixed-length bit set where bit `i` is set if and only if slot `i` is allocated.
///
/// Bits of the final word that lie beyond `len` are permanently set, so a search for a clear
/// bit never has to mask them out.
#[derive(Debug)]
pub(crate) struct SlotBitmap {
    words: Box<[Word]>,
    len: usize,
}

impl SlotBitmap {
    /// Creates a bitmap of `len` bits, all of them clear.
    #[must_use]
    pub(crate) fn new(len: usize) -> Self {
        let word_count = len.div_ceil(BITS_PER_WORD);
        let mut words = vec![0 as Word; word_count].into_boxed_slice();

        let tail_bits = len % BITS_PER_WORD;

        if tail_bits != 0 {
            if let Some(last) = words.last_mut() {
                // Everything above the tail is padding that must look occupied.
                *last = Word::MAX << tail_bits;
            }
        }

        Self { words, len }
    }

    /// Number of tracked bits.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Whether the bit at `index` is set.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub(crate) fn is_set(&self, index: usize) -> bool {
        let (word_index, bit) = self.locate(index);

        self.words
            .get(word_index)
            .is_some_and(|word| word & (1 << bit) != 0)
    }

    /// Sets the bit at `index` to `value`, returning the previous value.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub(crate) fn replace(&mut self, index: usize, value: bool) -> bool {
        let (word_index, bit) = self.locate(index);

        let word = self
            .words
            .get_mut(word_index)
            .expect("locate() guarantees the word index is in bounds");

        let mask: Word = 1 << bit;
        let previous = *word & mask != 0;

        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }

        previous
    }

    /// Number of set bits, not counting the padding of the final word.
    #[must_use]
    pub(crate) fn count_ones(&self) -> usize {
        let raw: usize = self
            .words
            .iter()
            .map(|word| word.count_ones() as usize)
            .sum();

        // Will not wrap because the padding bits are always set and included in `raw`.
        raw.wrapping_sub(self.padding_bits())
    }

    /// Finds a clear bit, preferring the word that contains `hint`.
    ///
    /// Bits at or above `hint` in the hint's word are checked first. If that word has no clear
    /// bit there, the whole bitmap is scanned from the start.
    #[must_use]
    pub(crate) fn next_clear_from(&self, hint: usize) -> Option<usize> {
        if hint < self.len {
            let (word_index, bit) = hint.div_rem(&BITS_PER_WORD);

            if let Some(word) = self.words.get(word_index) {
                let candidates = !word & (Word::MAX << bit);

                if candidates != 0 {
                    return Some(Self::index_of(word_index, candidates.trailing_zeros()));
                }
            }
        }

        self.first_clear()
    }

    /// Finds the lowest clear bit in the bitmap.
    #[must_use]
    pub(crate) fn first_clear(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != Word::MAX)
            .map(|(word_index, word)| Self::index_of(word_index, word.trailing_ones()))
    }

    fn locate(&self, index: usize) -> (usize, usize) {
        assert!(
            index < self.len,
            "bit {index} out of bounds for slot bitmap of length {}",
            self.len
        );

        index.div_rem(&BITS_PER_WORD)
    }

    fn padding_bits(&self) -> usize {
        // Cannot wrap: the word count is derived from `len` by rounding up.
        self.words
            .len()
            .wrapping_mul(BITS_PER_WORD)
            .wrapping_sub(self.len)
    }

    fn index_of(word_index: usize, bit: u32) -> usize {
        // Cannot wrap because that would imply a bitmap larger than virtual memory.
        word_index
            .wrapping_mul(BITS_PER_WORD)
            .wrapping_add(bit as usize)
    }
}

#[cfg(test)]
#[allow(
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use super::*;

    #[test]
    fn new_bitmap_is_all_clear() {
        let bitmap = SlotBitmap::new(100);

        assert_eq!(bitmap.len(), 100);
        assert_eq!(bitmap.count_ones(), 0);
        assert_eq!(bitmap.first_clear(), Some(0));

        for index in 0..100 {
            assert!(!bitmap.is_set(index));
        }
    }

    #[test]
    fn replace_reports_previous_value() {
        let mut bitmap = SlotBitmap::new(10);

        assert!(!bitmap.replace(3, true));
        assert!(bitmap.replace(3, true));
        assert!(bitmap.is_set(3));
        assert_eq!(bitmap.count_ones(), 1);

        assert!(bitmap.replace(3, false));
        assert!(!bitmap.is_set(3));
        assert_eq!(bitmap.count_ones(), 0);
    }

    #[test]
    fn padding_is_never_reported_as_clear() {
        let mut bitmap = SlotBitmap::new(3);

        for index in 0..3 {
            bitmap.replace(index, true);
        }

        assert_eq!(bitmap.count_ones(), 3);
        assert_eq!(bitmap.first_clear(), None);
        assert_eq!(bitmap.next_clear_from(2), None);
    }

    #[test]
    fn exact_word_multiple_has_no_padding() {
        let mut bitmap = SlotBitmap::new(128);

        for index in 0..128 {
            bitmap.replace(index, true);
        }

        assert_eq!(bitmap.count_ones(), 128);
        assert_eq!(bitmap.first_clear(), None);

        bitmap.replace(127, false);
        assert_eq!(bitmap.first_clear(), Some(127));
    }

    #[test]
    fn next_clear_prefers_bits_at_or_after_hint() {
        let mut bitmap = SlotBitmap::new(64);
        bitmap.replace(10, true);
        bitmap.replace(11, true);

        assert_eq!(bitmap.next_clear_from(10), Some(12));
        assert_eq!(bitmap.next_clear_from(5), Some(5));
    }

    #[test]
    fn next_clear_falls_back_to_full_scan() {
        let mut bitmap = SlotBitmap::new(200);

        // Fill the second word completely so a hint inside it finds nothing locally.
        for index in 64..128 {
            bitmap.replace(index, true);
        }

        bitmap.replace(0, true);

        assert_eq!(bitmap.next_clear_from(70), Some(1));
    }

    #[test]
    fn next_clear_ignores_lower_bits_in_hint_word() {
        let mut bitmap = SlotBitmap::new(64);

        for index in 8..64 {
            bitmap.replace(index, true);
        }

        // Only bits below the hint are clear, so the full scan must find them.
        assert_eq!(bitmap.next_clear_from(40), Some(0));
    }

    #[test]
    fn out_of_range_hint_scans_everything() {
        let mut bitmap = SlotBitmap::new(5);
        bitmap.replace(0, true);

        assert_eq!(bitmap.next_clear_from(99), Some(1));
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_access_panics() {
        let bitmap = SlotBitmap::new(5);
        _ = bitmap.is_set(5);
    }
}
