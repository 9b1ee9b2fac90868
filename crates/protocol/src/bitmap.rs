use serde::{Deserialize, Serialize};

/// Fixed-length completion bitmap, one bit per chunk.
///
/// Stored as 64-bit words so large files do not bloat persisted records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBitmap {
    len: u32,
    words: Vec<u64>,
}

impl ChunkBitmap {
    /// Creates a bitmap of `len` cleared bits.
    pub fn new(len: u32) -> Self {
        let words = (len as usize).div_ceil(64);
        Self {
            len,
            words: vec![0; words],
        }
    }

    /// Number of chunks tracked.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the bitmap tracks no chunks at all.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the word storage matches `len`, with no bits set past the
    /// end. Only a deserialized bitmap can fail this.
    pub fn is_well_formed(&self) -> bool {
        if self.words.len() != (self.len as usize).div_ceil(64) {
            return false;
        }
        match (self.words.last(), self.len % 64) {
            (Some(&last), tail) if tail != 0 => last >> tail == 0,
            _ => true,
        }
    }

    /// Returns the bit for `index`. Out-of-range indices read as unset.
    pub fn get(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, bit) = Self::locate(index);
        self.words.get(word).is_some_and(|w| w & (1 << bit) != 0)
    }

    /// Sets the bit for `index`.
    ///
    /// Returns `true` if the bit was previously unset. Out-of-range indices
    /// are ignored and return `false`.
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, bit) = Self::locate(index);
        let Some(word) = self.words.get_mut(word) else {
            return false;
        };
        let mask = 1 << bit;
        let was_unset = *word & mask == 0;
        *word |= mask;
        was_unset
    }

    /// Number of set bits.
    pub fn count_set(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Whether every chunk is marked done.
    pub fn is_complete(&self) -> bool {
        self.count_set() == self.len
    }

    /// Indices of unset bits, in ascending order.
    pub fn unset(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(|&i| !self.get(i))
    }

    /// Indices of set bits, in ascending order.
    pub fn set_indices(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(|&i| self.get(i))
    }

    fn locate(index: u32) -> (usize, u32) {
        ((index / 64) as usize, index % 64)
    }
}
