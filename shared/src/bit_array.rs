use alloc::{vec, vec::Vec};

const WORD_BITS: usize = u32::BITS as usize;

/// A fixed-length array of bits, one per tracked resource (e.g. swap slot).
#[derive(Clone, Debug)]
pub struct BitArray {
    words: Vec<u32>,
    len: usize,
}

impl BitArray {
    /// Creates an array of `len` bits, all cleared.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of range ({} bits)", self.len);
        self.words[idx / WORD_BITS] >> (idx % WORD_BITS) & 1 != 0
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of range ({} bits)", self.len);
        let mask = 1 << (idx % WORD_BITS);
        if value {
            self.words[idx / WORD_BITS] |= mask;
        } else {
            self.words[idx / WORD_BITS] &= !mask;
        }
    }

    pub fn set_all(&mut self, value: bool) {
        self.words.fill(if value { u32::MAX } else { 0 });
    }

    /// Number of bits equal to `value`.
    pub fn count(&self, value: bool) -> usize {
        let ones = (0..self.len).filter(|&idx| self.get(idx)).count();
        if value {
            ones
        } else {
            self.len - ones
        }
    }

    /// Finds the first bit at or after `start` equal to `value`, flips it and
    /// returns its index.
    pub fn scan_and_flip(&mut self, start: usize, value: bool) -> Option<usize> {
        let idx = (start..self.len).find(|&idx| self.get(idx) == value)?;
        self.set(idx, !value);
        Some(idx)
    }
}
