use std::fmt;

pub type BitChunk = u64;

/// Get the index and bit offset for a specified index. For example, if we
/// are using 64-bit chunks, then index 74 would return (1, 10). The second
/// number is guaranteed to be less than `BitChunk::BITS`.
///
/// The chunk index is not guaranteed to be accessible. You should check
/// first.
fn index_offset(index: usize) -> (usize, usize) {
    let chunk_index = index / BitChunk::BITS as usize;
    let bit_offset = index % BitChunk::BITS as usize;
    (chunk_index, bit_offset)
}

/// One bit per block. A **high** bit means the block is free (uncommitted), a
/// low bit means it's committed and handed out. Starting all-high means a
/// fresh bitmap is "everything free" and the first-free scan is just a
/// `trailing_zeros()` per chunk.
///
/// Bits past `len` in the last chunk are kept low, so they never look free.
pub struct BlockBitmap {
    chunks: Box<[BitChunk]>,
    len: usize,
}

impl BlockBitmap {
    /// A bitmap of `len` blocks, all free
    pub fn new(len: usize) -> Self {
        let (full, rem) = index_offset(len);
        let mut chunks = vec![BitChunk::MAX; full + (rem != 0) as usize].into_boxed_slice();
        if rem != 0 {
            chunks[full] = (1 << rem) - 1;
        }
        Self { chunks, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Panics
    /// - If `index >= self.len()`
    pub fn is_free(&self, index: usize) -> bool {
        assert!(index < self.len, "block #{index} out of range");
        let (chunk_index, bit_index) = index_offset(index);
        self.chunks[chunk_index] & (1 << bit_index) != 0
    }

    /// Mark block `index` as free
    pub fn set_high(&mut self, index: usize) {
        assert!(index < self.len, "block #{index} out of range");
        let (chunk_index, bit_index) = index_offset(index);
        self.chunks[chunk_index] |= 1 << bit_index;
    }

    /// Mark block `index` as in use
    pub fn set_low(&mut self, index: usize) {
        assert!(index < self.len, "block #{index} out of range");
        let (chunk_index, bit_index) = index_offset(index);
        self.chunks[chunk_index] &= !(1 << bit_index);
    }

    /// Index of the lowest free block
    pub fn first_free(&self) -> Option<usize> {
        self.chunks
            .iter()
            .enumerate()
            .find(|(_, chunk)| **chunk != 0)
            .map(|(chunk_index, chunk)| {
                chunk_index * BitChunk::BITS as usize + chunk.trailing_zeros() as usize
            })
    }

    pub fn count_free(&self) -> usize {
        self.chunks.iter().map(|c| c.count_ones() as usize).sum()
    }

    pub fn count_used(&self) -> usize {
        self.len - self.count_free()
    }

    /// Indices of all in-use blocks, ascending
    pub fn iter_used(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|i| !self.is_free(*i))
    }
}

impl fmt::Debug for BlockBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockBitmap[")?;
        for i in 0..self.len {
            write!(f, "{}", if self.is_free(i) { '.' } else { '#' })?;
        }
        write!(f, "]")
    }
}
