//! Fixed-width word-backed bit array with doubling growth.

/// Bits per backing word.
const WORD_BITS: usize = 64;

/// A growable bit array backed by `u64` words.
///
/// Positions are addressed directly; [`BitArray::resize`] grows the backing
/// store while preserving every previously recorded bit. The set-bit count is
/// maintained incrementally so [`BitArray::count`] is O(1).
#[derive(Debug, Clone)]
pub struct BitArray {
    words: Vec<u64>,
    /// Capacity in bits.
    size: u64,
    /// Number of set bits.
    count: u64,
}

impl BitArray {
    /// Allocate an array covering `size` bit positions. Rounds up to a whole
    /// number of words.
    pub fn allocate(size: u64) -> Self {
        let words = (size as usize).div_ceil(WORD_BITS).max(1);
        Self {
            words: vec![0; words],
            size: (words * WORD_BITS) as u64,
            count: 0,
        }
    }

    /// Capacity in bits.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of set bits.
    pub fn count(&self) -> u64 {
        self.count
    }

    fn position(index: u64) -> (usize, u32) {
        ((index as usize) / WORD_BITS, (index % WORD_BITS as u64) as u32)
    }

    /// Whether the bit at `index` is set. Positions at or beyond the current
    /// capacity read as unset.
    pub fn get(&self, index: u64) -> bool {
        if index >= self.size {
            return false;
        }
        let (word, bit) = Self::position(index);
        self.words[word] & (1u64 << bit) != 0
    }

    /// Set the bit at `index`, which must be within capacity. Returns whether
    /// this call changed the bit from unset to set.
    pub fn set(&mut self, index: u64) -> bool {
        debug_assert!(index < self.size, "bit index {} beyond capacity {}", index, self.size);
        let (word, bit) = Self::position(index);
        let mask = 1u64 << bit;
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.count += 1;
        true
    }

    /// Grow the array to cover at least `size` bits. Existing bit state is
    /// preserved; shrinking is not supported and is a no-op.
    pub fn resize(&mut self, size: u64) {
        if size <= self.size {
            return;
        }
        let words = (size as usize).div_ceil(WORD_BITS);
        self.words.resize(words, 0);
        self.size = (words * WORD_BITS) as u64;
    }

    /// Independent copy of the current bit state.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Release the backing words. The array reads as empty afterwards.
    pub fn close(&mut self) {
        self.words = Vec::new();
        self.size = 0;
        self.count = 0;
    }
}
