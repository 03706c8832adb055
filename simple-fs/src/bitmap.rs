use alloc::{vec, vec::Vec};

use crate::{
    block_dev::BlockDevice, error::Resource, layout::get_u32, BlockNumber, SfsError, SfsResult,
};

/// In-memory mirror of the free-space bitmap block.
///
/// One bit per data block, 1 = free, 0 = allocated. Bits at or past
/// `capacity` are kept at 0 so a scan can never hand them out.
pub struct Bitmap {
    block_id: usize,
    capacity: usize,
    words: Vec<u64>,
}

impl Bitmap {
    /// All `capacity` blocks free
    pub fn new_free(block_id: usize, block_size: usize, capacity: usize) -> Self {
        let mut words = vec![0u64; block_size / 8];
        for (pos, word) in words.iter_mut().enumerate() {
            let low = pos * 64;
            if low + 64 <= capacity {
                *word = u64::MAX;
            } else if low < capacity {
                *word = (1u64 << (capacity - low)) - 1;
            }
        }
        Self {
            block_id,
            capacity,
            words,
        }
    }

    /// Load the mirror from its block
    pub fn load(
        block_id: usize,
        capacity: usize,
        block_device: &dyn BlockDevice,
    ) -> SfsResult<Self> {
        let raw = block_device.read_to_vec(block_id, 1)?;
        let mut words: Vec<u64> = raw
            .chunks_exact(8)
            .map(|chunk| (get_u32(chunk, 4) as u64) << 32 | get_u32(chunk, 0) as u64)
            .collect();
        // never trust bits past the data region
        for (pos, word) in words.iter_mut().enumerate() {
            let low = pos * 64;
            if low >= capacity {
                *word = 0;
            } else if low + 64 > capacity {
                *word &= (1u64 << (capacity - low)) - 1;
            }
        }
        Ok(Self {
            block_id,
            capacity,
            words,
        })
    }

    /// Write the whole bitmap block through to the device
    pub fn sync(&self, block_device: &dyn BlockDevice) -> SfsResult<()> {
        let mut raw = Vec::with_capacity(self.words.len() * 8);
        for word in &self.words {
            raw.extend_from_slice(&word.to_le_bytes());
        }
        block_device.write_blocks(self.block_id, &raw)
    }

    /// Lowest free block, claimed and persisted
    pub fn alloc(&mut self, block_device: &dyn BlockDevice) -> SfsResult<BlockNumber> {
        let (pos, word) = self
            .words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != 0)
            .ok_or(SfsError::Full(Resource::DataBlock))?;
        let inner = word.trailing_zeros() as usize;
        self.words[pos] &= !(1u64 << inner);
        if let Err(err) = self.sync(block_device) {
            self.words[pos] |= 1u64 << inner;
            return Err(err);
        }
        Ok((pos * 64 + inner) as BlockNumber)
    }

    /// Return a block to the free pool and persist. Freeing a free block is
    /// a caller bug.
    pub fn dealloc(&mut self, block_device: &dyn BlockDevice, block: BlockNumber) -> SfsResult<()> {
        let (pos, inner) = decomposition(block);
        debug_assert!((block as usize) < self.capacity);
        debug_assert!(self.words[pos] & (1u64 << inner) == 0, "double free of {}", block);
        self.words[pos] |= 1u64 << inner;
        self.sync(block_device)
    }

    /// Whether `block` is currently free
    pub fn is_free(&self, block: BlockNumber) -> bool {
        let (pos, inner) = decomposition(block);
        (block as usize) < self.capacity && self.words[pos] & (1u64 << inner) != 0
    }

    /// Number of free blocks
    pub fn free_count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Return (word_pos, inner_pos)
fn decomposition(block: BlockNumber) -> (usize, usize) {
    let bit = block as usize;
    (bit / 64, bit % 64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryDevice;

    #[test]
    fn allocation_is_first_fit() {
        let dev = MemoryDevice::new(64, 4);
        let mut bitmap = Bitmap::new_free(1, 64, 100);
        assert_eq!(bitmap.alloc(&dev).unwrap(), 0);
        assert_eq!(bitmap.alloc(&dev).unwrap(), 1);
        assert_eq!(bitmap.alloc(&dev).unwrap(), 2);
        bitmap.dealloc(&dev, 1).unwrap();
        assert_eq!(bitmap.alloc(&dev).unwrap(), 1);
        assert_eq!(bitmap.alloc(&dev).unwrap(), 3);
        assert_eq!(bitmap.free_count(), 96);
    }

    #[test]
    fn exhaustion_reports_full_and_never_passes_capacity() {
        let dev = MemoryDevice::new(64, 4);
        let mut bitmap = Bitmap::new_free(1, 64, 70);
        for expected in 0..70 {
            assert_eq!(bitmap.alloc(&dev).unwrap(), expected);
        }
        assert_eq!(bitmap.alloc(&dev), Err(SfsError::Full(Resource::DataBlock)));
        assert!(!bitmap.is_free(70));
    }

    #[test]
    fn every_change_is_written_through() {
        let dev = MemoryDevice::new(64, 4);
        let mut bitmap = Bitmap::new_free(2, 64, 10);
        bitmap.sync(&dev).unwrap();
        bitmap.alloc(&dev).unwrap();
        bitmap.alloc(&dev).unwrap();
        let reloaded = Bitmap::load(2, 10, &dev).unwrap();
        assert!(!reloaded.is_free(0));
        assert!(!reloaded.is_free(1));
        assert!(reloaded.is_free(2));
        assert_eq!(reloaded.free_count(), 8);
        bitmap.dealloc(&dev, 0).unwrap();
        assert!(Bitmap::load(2, 10, &dev).unwrap().is_free(0));
    }
}
